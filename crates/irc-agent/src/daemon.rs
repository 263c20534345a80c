//! Daemon: keeps one IRC session alive and serves the control plane.
//!
//! High-level flow per iteration:
//! - Poll every directive source. `Send` joins the back of the outbound
//!   queue, which is then written in order; `Stop` ends the loop once the
//!   sends polled before it are written.
//! - Do one bounded read. Complete lines go through the protocol handler;
//!   keep-alive replies are written as soon as their line is seen, chat lines
//!   are appended to the inbox and offered to the message handler.
//! - On a transport fault, release the session, wait the fixed backoff and
//!   connect again, forever, while still honouring `Stop` between attempts.
//!
//! Everything runs on the caller's thread; the socket read timeout is what
//! keeps the loop responsive to the command queue.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::connection::ConnectionManager;
use crate::control::{Directive, DirectiveSource, Inbox, Status, StatusFile};
use crate::error::{ConnectError, TransportError};
use crate::protocol::{
  ChatMessage, MessageHandler, NoReply, Outbound, ProtocolHandler, Reaction, SessionContext,
};
use crate::wire::{InboundLine, LineDecoder};

/// Token carried by our own idle keep-alive probe.
const KEEPALIVE_TOKEN: &str = "keepalive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
  Running,
  Stopped,
}

/// Timing knobs of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopTiming {
  pub receive_timeout: Duration,
  pub reconnect_backoff: Duration,
  pub keepalive_idle: Option<Duration>,
}

impl From<&TimingConfig> for LoopTiming {
  fn from(cfg: &TimingConfig) -> Self {
    Self {
      receive_timeout: cfg.receive_timeout(),
      reconnect_backoff: cfg.reconnect_backoff(),
      keepalive_idle: cfg.keepalive_idle(),
    }
  }
}

/// Collects the collaborators of a [`Daemon`] before the first connect.
pub struct DaemonBuilder {
  conn: ConnectionManager,
  inbox: Inbox,
  timing: LoopTiming,
  sources: Vec<Box<dyn DirectiveSource>>,
  hook: Box<dyn MessageHandler>,
  status: Option<StatusFile>,
  quit_message: String,
}

impl DaemonBuilder {
  #[must_use]
  pub fn new(conn: ConnectionManager, inbox: Inbox, timing: LoopTiming) -> Self {
    Self {
      conn,
      inbox,
      timing,
      sources: Vec::new(),
      hook: Box::new(NoReply),
      status: None,
      quit_message: "Daemon stopped".to_string(),
    }
  }

  /// Adds a directive source. Sources are polled in the order added.
  #[must_use]
  pub fn source(mut self, source: impl DirectiveSource + 'static) -> Self {
    self.sources.push(Box::new(source));
    self
  }

  #[must_use]
  pub fn handler(mut self, hook: impl MessageHandler + 'static) -> Self {
    self.hook = Box::new(hook);
    self
  }

  #[must_use]
  pub fn status_file(mut self, status: StatusFile) -> Self {
    self.status = Some(status);
    self
  }

  #[must_use]
  pub fn quit_message(mut self, message: impl Into<String>) -> Self {
    self.quit_message = message.into();
    self
  }

  /// Performs the first connect and returns a running daemon.
  ///
  /// # Errors
  /// The first connect is not retried: its `ConnectError` is returned as is.
  pub fn start(self) -> Result<Daemon, ConnectError> {
    let ctx = SessionContext {
      nickname: self.conn.server().nickname.clone(),
      channel: self.conn.server().channel.clone(),
    };
    let mut daemon = Daemon {
      conn: self.conn,
      handler: ProtocolHandler::new(ctx),
      hook: self.hook,
      sources: self.sources,
      decoder: LineDecoder::new(),
      inbox: self.inbox,
      status: self.status,
      timing: self.timing,
      quit_message: self.quit_message,
      state: DaemonState::Running,
      pending: VecDeque::new(),
      last_activity: Instant::now(),
      closed: false,
    };
    daemon.set_status(&Status::Starting);
    if let Err(err) = daemon.conn.connect() {
      error!("Connection failed: {err}");
      daemon.set_status(&Status::Error(err.to_string()));
      return Err(err);
    }
    daemon.on_connected();
    Ok(daemon)
  }
}

/// The running daemon. Create it with [`DaemonBuilder::start`].
pub struct Daemon {
  conn: ConnectionManager,
  handler: ProtocolHandler,
  hook: Box<dyn MessageHandler>,
  sources: Vec<Box<dyn DirectiveSource>>,
  decoder: LineDecoder,
  inbox: Inbox,
  status: Option<StatusFile>,
  timing: LoopTiming,
  quit_message: String,
  state: DaemonState,
  /// Directive sends in arrival order. Only the front is ever written, so a
  /// reconnect in the middle of a flush cannot reorder them.
  pending: VecDeque<Outbound>,
  last_activity: Instant,
  closed: bool,
}

impl Daemon {
  #[must_use]
  pub fn state(&self) -> DaemonState {
    self.state
  }

  /// Runs until a `Stop` directive arrives, then disconnects gracefully.
  pub fn run(&mut self) {
    info!("Daemon running");
    while self.run_once() == DaemonState::Running {}
    self.shutdown();
  }

  /// One scheduling step. Once `Stopped` this is a no-op.
  pub fn run_once(&mut self) -> DaemonState {
    if self.state == DaemonState::Stopped {
      return self.state;
    }

    let directives = self.poll_sources();
    let stop = self.queue_directives(directives);
    self.flush_pending();
    if stop {
      self.state = DaemonState::Stopped;
    }
    if self.state == DaemonState::Stopped {
      return self.state;
    }

    match self.conn.try_receive(self.timing.receive_timeout) {
      Ok(bytes) if bytes.is_empty() => self.keepalive_if_idle(),
      Ok(bytes) => {
        self.last_activity = Instant::now();
        self.decoder.push(&bytes);
        self.process_lines();
      }
      Err(err) => self.handle_fault(&err),
    }
    // A reconnect above may have queued fresh sends.
    self.flush_pending();
    self.state
  }

  /// Sends `QUIT`, releases the socket and publishes `STOPPED`. Idempotent.
  pub fn shutdown(&mut self) {
    self.state = DaemonState::Stopped;
    if self.closed {
      return;
    }
    self.closed = true;
    self.conn.close(&self.quit_message);
    self.set_status(&Status::Stopped);
    info!("Stopped");
  }

  fn poll_sources(&mut self) -> Vec<Directive> {
    self
      .sources
      .iter_mut()
      .flat_map(|source| source.poll())
      .collect()
  }

  /// Appends every `Send` to the outbound queue. Returns true on `Stop`;
  /// directives after it are discarded.
  fn queue_directives(&mut self, directives: Vec<Directive>) -> bool {
    for directive in directives {
      match directive {
        Directive::Stop => {
          info!("Quit command received");
          return true;
        }
        Directive::Send { target, text } => {
          info!("Sending to {target}: {text}");
          self.pending.push_back(Outbound::privmsg(&target, &text));
        }
      }
    }
    false
  }

  /// Writes queued sends from the front while a session is up.
  ///
  /// A send whose write fails is dropped and the connection is rebuilt;
  /// whatever is still queued then goes to the new session in order.
  fn flush_pending(&mut self) {
    while self.state == DaemonState::Running && self.conn.is_connected() {
      let Some(cmd) = self.pending.front().cloned() else {
        return;
      };
      let sent = self.conn.send(&cmd);
      self.pending.pop_front();
      if let Err(err) = sent {
        warn!("Dropped '{cmd}': {err}");
        self.handle_fault(&err);
      }
    }
  }

  fn process_lines(&mut self) {
    while self.state == DaemonState::Running {
      let Some(line) = self.decoder.next_line() else {
        return;
      };
      match self.handler.handle(&line.text) {
        Reaction::Reply(reply) => {
          if let Err(err) = self.conn.send(&reply) {
            self.handle_fault(&err);
            return;
          }
        }
        Reaction::Chat(msg) => {
          if !self.on_chat(&line, &msg) {
            return;
          }
        }
        Reaction::Welcome => debug!("Late welcome: {}", line.text),
        Reaction::Membership { .. }
        | Reaction::ServerError(_)
        | Reaction::Drop(_)
        | Reaction::Ignore => {}
      }
    }
  }

  /// Records a chat line and sends the handler's replies. Returns false if
  /// a reply hit a transport fault.
  fn on_chat(&mut self, line: &InboundLine, msg: &ChatMessage) -> bool {
    info!("{} -> {}: {}", msg.sender, msg.target, msg.body);
    if let Err(err) = self.inbox.append(line) {
      warn!(
        "Failed to append to inbox {}: {err}",
        self.inbox.path().display()
      );
    }
    if msg
      .sender
      .eq_ignore_ascii_case(&self.handler.context().nickname)
    {
      return true;
    }
    for reply in self.hook.on_message(msg) {
      if let Err(err) = self.conn.send(&reply) {
        warn!("Dropped '{reply}': {err}");
        self.handle_fault(&err);
        return false;
      }
    }
    true
  }

  fn keepalive_if_idle(&mut self) {
    let Some(idle) = self.timing.keepalive_idle else {
      return;
    };
    if self.last_activity.elapsed() < idle {
      return;
    }
    self.last_activity = Instant::now();
    debug!("Nothing received for {}s, probing server", idle.as_secs());
    if let Err(err) = self.conn.send(&Outbound::Ping(KEEPALIVE_TOKEN.to_string())) {
      self.handle_fault(&err);
    }
  }

  fn handle_fault(&mut self, err: &TransportError) {
    warn!("Connection lost: {err}");
    self.set_status(&Status::Error(err.to_string()));
    self.reconnect();
  }

  /// Fixed-backoff reconnect loop. Returns once connected or stopped.
  fn reconnect(&mut self) {
    self.conn.release();
    self.decoder.reset();
    self.set_status(&Status::Reconnecting);
    loop {
      info!(
        "Reconnecting in {}s...",
        self.timing.reconnect_backoff.as_secs()
      );
      thread::sleep(self.timing.reconnect_backoff);

      let directives = self.poll_sources();
      if self.queue_directives(directives) {
        self.state = DaemonState::Stopped;
        return;
      }

      match self.conn.connect() {
        Ok(()) => {
          self.on_connected();
          return;
        }
        Err(err) => {
          warn!("Reconnect failed: {err}");
          self.set_status(&Status::Error(err.to_string()));
        }
      }
    }
  }

  fn on_connected(&mut self) {
    self.last_activity = Instant::now();
    let server = self.conn.server();
    let status = Status::Connected {
      host: server.host.clone(),
      port: server.port,
      nickname: server.nickname.clone(),
      channel: server.channel.clone(),
    };
    self.set_status(&status);
  }

  fn set_status(&self, status: &Status) {
    if let Some(file) = &self.status
      && let Err(err) = file.write(status)
    {
      warn!("Failed to write status '{status}': {err}");
    }
  }
}
