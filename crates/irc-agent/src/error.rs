//! Error taxonomy for the daemon.
//!
//! Only [`ConnectError`] on the very first connect attempt is allowed to end
//! the process. Everything else is absorbed by the daemon loop and turned into
//! a log line plus a reconnect or a dropped line.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The transport to the server could not be established or registered.
#[derive(Debug, Error)]
pub enum ConnectError {
  #[error("failed to resolve {addr}: {source}")]
  Resolve {
    addr: String,
    #[source]
    source: io::Error,
  },
  #[error("no address found for {addr}")]
  NoAddress { addr: String },
  #[error("failed to connect to {addr}: {source}")]
  Io {
    addr: String,
    #[source]
    source: io::Error,
  },
  #[error("server closed the connection during the handshake")]
  Closed,
  #[error("no welcome from server within {}s", .0.as_secs())]
  WelcomeTimeout(Duration),
  #[error("handshake failed: {0}")]
  Transport(#[from] TransportError),
}

/// A fault on an established session. Triggers reconnection, never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("connection closed by peer")]
  Closed,
  #[error("no active session")]
  NotConnected,
  #[error("transport I/O error: {0}")]
  Io(#[from] io::Error),
}

/// A received line that does not fit the expected positional layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {command} line: {line}")]
pub struct MalformedLine {
  pub command: &'static str,
  pub line: String,
}

/// A command queue line that is not a known directive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlParseError {
  #[error("unknown command: {0}")]
  Unrecognized(String),
  #[error("missing {field} in directive: {line}")]
  MissingField { field: &'static str, line: String },
}
