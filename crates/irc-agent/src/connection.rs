//! Connection Manager: owns the socket lifecycle for one server.
//!
//! Invariants:
//! - At most one `Session` exists at a time. `connect` releases the previous
//!   one before opening a new transport.
//! - `JOIN` is only sent after the server acknowledged registration with
//!   `001`, never on a fixed timer.
//! - Bytes that arrive after the welcome line during the handshake are kept
//!   and returned by the next `try_receive`, so no line is lost.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::control::Outbox;
use crate::error::{ConnectError, TransportError};
use crate::protocol::{Outbound, SessionContext, is_ping, is_welcome, pong_for};
use crate::wire::{LineDecoder, encode};

/// Size of a single socket read.
const READ_CHUNK: usize = 4096;

/// Upper bound for one read while waiting for the welcome numeric.
const HANDSHAKE_POLL: Duration = Duration::from_millis(250);

/// Byte stream to an IRC server.
pub trait Transport: Read + Write + Send {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
  fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
  fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
    TcpStream::set_read_timeout(self, timeout)
  }

  fn shutdown(&self) -> io::Result<()> {
    TcpStream::shutdown(self, Shutdown::Both)
  }
}

/// Opens transports. Swapped out in tests for scripted connections.
pub trait Connector: Send {
  fn connect(&mut self, host: &str, port: u16) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Plain TCP with a bounded connect timeout per resolved address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
  timeout: Duration,
}

impl TcpConnector {
  #[must_use]
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }
}

impl Connector for TcpConnector {
  fn connect(&mut self, host: &str, port: u16) -> Result<Box<dyn Transport>, ConnectError> {
    let addr = format!("{host}:{port}");
    let resolved = (host, port)
      .to_socket_addrs()
      .map_err(|source| ConnectError::Resolve {
        addr: addr.clone(),
        source,
      })?;
    let mut last_err = None;
    for sock_addr in resolved {
      match TcpStream::connect_timeout(&sock_addr, self.timeout) {
        Ok(stream) => {
          let _ = stream.set_nodelay(true);
          return Ok(Box::new(stream));
        }
        Err(err) => {
          debug!("Connect to {sock_addr} failed: {err}");
          last_err = Some(err);
        }
      }
    }
    match last_err {
      Some(source) => Err(ConnectError::Io { addr, source }),
      None => Err(ConnectError::NoAddress { addr }),
    }
  }
}

/// One logical connection to the server.
pub struct Session {
  host: String,
  port: u16,
  nickname: String,
  channel: String,
  transport: Box<dyn Transport>,
  registered: bool,
  /// Bytes read during the handshake that belong to the main loop.
  pending: Vec<u8>,
  read_timeout: Option<Duration>,
}

impl Session {
  fn new(server: &ServerConfig, transport: Box<dyn Transport>) -> Self {
    Self {
      host: server.host.clone(),
      port: server.port,
      nickname: server.nickname.clone(),
      channel: server.channel.clone(),
      transport,
      registered: false,
      pending: Vec::new(),
      read_timeout: None,
    }
  }

  /// True once the welcome arrived and `JOIN` was sent.
  #[must_use]
  pub fn is_registered(&self) -> bool {
    self.registered
  }

  #[must_use]
  pub fn context(&self) -> SessionContext {
    SessionContext {
      nickname: self.nickname.clone(),
      channel: self.channel.clone(),
    }
  }

  fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
    self.transport.write_all(&encode(line))?;
    self.transport.flush()?;
    Ok(())
  }

  fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
    // A zero read timeout is rejected by the socket API.
    let timeout = timeout.max(Duration::from_millis(1));
    if self.read_timeout != Some(timeout) {
      self.transport.set_read_timeout(Some(timeout))?;
      self.read_timeout = Some(timeout);
    }
    let mut buf = [0_u8; READ_CHUNK];
    match self.transport.read(&mut buf) {
      Ok(0) => Err(TransportError::Closed),
      Ok(n) => Ok(buf[..n].to_vec()),
      Err(e)
        if matches!(
          e.kind(),
          ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
        ) =>
      {
        Ok(Vec::new())
      }
      Err(e) => Err(TransportError::Io(e)),
    }
  }

  fn teardown(self) {
    debug!("Closing session to {}:{}", self.host, self.port);
    let _ = self.transport.shutdown();
  }
}

pub struct ConnectionManager {
  server: ServerConfig,
  connector: Box<dyn Connector>,
  welcome_timeout: Duration,
  session: Option<Session>,
  outbox: Option<Outbox>,
}

impl ConnectionManager {
  #[must_use]
  pub fn new(server: ServerConfig, connector: Box<dyn Connector>, welcome_timeout: Duration) -> Self {
    Self {
      server,
      connector,
      welcome_timeout,
      session: None,
      outbox: None,
    }
  }

  /// Records every written line in `outbox`.
  #[must_use]
  pub fn with_outbox(mut self, outbox: Outbox) -> Self {
    self.outbox = Some(outbox);
    self
  }

  #[must_use]
  pub fn server(&self) -> &ServerConfig {
    &self.server
  }

  #[must_use]
  pub fn session(&self) -> Option<&Session> {
    self.session.as_ref()
  }

  #[must_use]
  pub fn is_connected(&self) -> bool {
    self.session.is_some()
  }

  /// Opens a transport, registers and joins the configured channel.
  ///
  /// # Errors
  /// Returns `ConnectError` when the transport cannot be opened, the server
  /// hangs up during registration, or no welcome arrives in time. No session
  /// is kept in that case.
  pub fn connect(&mut self) -> Result<(), ConnectError> {
    self.release();
    info!(
      "Connecting to {}:{}...",
      self.server.host, self.server.port
    );
    let transport = self.connector.connect(&self.server.host, self.server.port)?;
    self.session = Some(Session::new(&self.server, transport));
    if let Err(err) = self.register() {
      self.release();
      return Err(err);
    }
    info!(
      "Connected as {} in {}",
      self.server.nickname, self.server.channel
    );
    Ok(())
  }

  fn register(&mut self) -> Result<(), ConnectError> {
    let nick = self.server.nickname.clone();
    self.send(&Outbound::Nick(nick.clone()))?;
    self.send(&Outbound::User(nick))?;
    info!("Waiting for server welcome...");
    self.wait_for_welcome()?;
    self.send(&Outbound::Join(self.server.channel.clone()))?;
    self.session_mut()?.registered = true;
    Ok(())
  }

  fn wait_for_welcome(&mut self) -> Result<(), ConnectError> {
    let deadline = Instant::now() + self.welcome_timeout;
    let mut decoder = LineDecoder::new();
    loop {
      let now = Instant::now();
      if now >= deadline {
        return Err(ConnectError::WelcomeTimeout(self.welcome_timeout));
      }
      let wait = (deadline - now).min(HANDSHAKE_POLL);
      let bytes = match self.session_mut()?.read_chunk(wait) {
        Ok(bytes) => bytes,
        Err(TransportError::Closed) => return Err(ConnectError::Closed),
        Err(err) => return Err(err.into()),
      };
      decoder.push(&bytes);
      while let Some(line) = decoder.next_line() {
        if is_ping(&line.text) {
          self.send(&pong_for(&line.text))?;
        } else if is_welcome(&line.text) {
          self.session_mut()?.pending = decoder.take_remainder();
          return Ok(());
        } else {
          debug!("<- {}", line.text);
        }
      }
    }
  }

  /// Bounded read. An empty result means the timeout elapsed.
  ///
  /// # Errors
  /// `TransportError` on end of stream, an I/O fault, or without a session.
  pub fn try_receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
    let session = self.session_mut()?;
    if !session.pending.is_empty() {
      return Ok(std::mem::take(&mut session.pending));
    }
    session.read_chunk(timeout)
  }

  /// Writes one command as a terminated line.
  ///
  /// # Errors
  /// `TransportError` when the write fails or there is no session.
  pub fn send(&mut self, cmd: &Outbound) -> Result<(), TransportError> {
    let line = cmd.to_string();
    self.session_mut()?.write_line(&line)?;
    debug!("-> {line}");
    self.record(&line);
    Ok(())
  }

  /// Sends `QUIT` and releases the session. Never fails.
  pub fn close(&mut self, reason: &str) {
    let Some(mut session) = self.session.take() else {
      return;
    };
    let line = Outbound::quit(reason).to_string();
    match session.write_line(&line) {
      Ok(()) => self.record(&line),
      Err(err) => debug!("QUIT not delivered: {err}"),
    }
    session.teardown();
  }

  /// Drops the current session without sending anything.
  pub fn release(&mut self) {
    if let Some(session) = self.session.take() {
      session.teardown();
    }
  }

  fn session_mut(&mut self) -> Result<&mut Session, TransportError> {
    self.session.as_mut().ok_or(TransportError::NotConnected)
  }

  fn record(&self, line: &str) {
    if let Some(outbox) = &self.outbox
      && let Err(err) = outbox.append(line)
    {
      warn!("Failed to append to outbox: {err}");
    }
  }
}
