//! File-based control plane.
//!
//! External processes steer the daemon by appending directives to
//! `commands.txt` and follow the conversation by tailing `inbox.txt`. The
//! daemon additionally keeps `outbox.txt` (every line it wrote to the socket)
//! and `status.txt` (current lifecycle state).

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::warn;

use crate::error::ControlParseError;
use crate::wire::InboundLine;

/// Instruction read from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
  Send { target: String, text: String },
  Stop,
}

impl Directive {
  #[must_use]
  pub fn send(target: impl Into<String>, text: impl Into<String>) -> Self {
    Self::Send {
      target: target.into(),
      text: text.into(),
    }
  }
}

/// Renders the command-file form, the inverse of [`parse_directive`].
impl fmt::Display for Directive {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Send { target, text } => write!(f, "SEND {target} {text}"),
      Self::Stop => f.write_str("QUIT"),
    }
  }
}

/// Parses one command-file line. Blank lines yield `Ok(None)`.
pub fn parse_directive(line: &str) -> Result<Option<Directive>, ControlParseError> {
  let line = line.trim();
  if line.is_empty() {
    return Ok(None);
  }
  let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
  match command {
    "QUIT" if rest.is_empty() => Ok(Some(Directive::Stop)),
    "SEND" => {
      let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
      if target.is_empty() {
        return Err(ControlParseError::MissingField {
          field: "target",
          line: line.to_string(),
        });
      }
      if text.is_empty() {
        return Err(ControlParseError::MissingField {
          field: "text",
          line: line.to_string(),
        });
      }
      Ok(Some(Directive::send(target, text)))
    }
    _ => Err(ControlParseError::Unrecognized(line.to_string())),
  }
}

/// Anything the daemon loop polls for directives.
pub trait DirectiveSource: Send {
  /// Returns the directives that arrived since the last poll, in order.
  /// Each directive is returned at most once.
  fn poll(&mut self) -> Vec<Directive>;
}

/// The `commands.txt` queue.
///
/// Clearing is done by renaming the file to a sibling claim file before
/// reading it, so a concurrent `>>` append either lands in the claimed file
/// or in a fresh command file that the next poll picks up.
#[derive(Debug, Clone)]
pub struct CommandFile {
  path: PathBuf,
  claim: PathBuf,
}

impl CommandFile {
  #[must_use]
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let mut claim = OsString::from(path.as_os_str());
    claim.push(".processing");
    Self {
      path,
      claim: PathBuf::from(claim),
    }
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Creates the file if missing without touching existing content.
  pub fn ensure_exists(&self) -> io::Result<()> {
    OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .map(drop)
  }

  /// Atomically claims and returns the current lines, leaving an empty queue.
  ///
  /// A claim file left behind by an earlier failed read is consumed first, so
  /// its lines come out ahead of the current queue and are never overwritten.
  pub fn take_lines(&self) -> io::Result<Vec<String>> {
    let mut lines = self.recover_claim()?;
    match fs::metadata(&self.path) {
      Ok(meta) if meta.len() == 0 => return Ok(lines),
      Ok(_) => {}
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(lines),
      Err(e) => return Err(e),
    }
    match fs::rename(&self.path, &self.claim) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(lines),
      Err(e) => return Err(e),
    }
    let _ = self.ensure_exists();
    lines.extend(self.read_claim()?);
    Ok(lines)
  }

  fn recover_claim(&self) -> io::Result<Vec<String>> {
    if !self.claim.exists() {
      return Ok(Vec::new());
    }
    let lines = self.read_claim()?;
    warn!(
      "Recovered {} unprocessed line(s) from {}",
      lines.len(),
      self.claim.display()
    );
    Ok(lines)
  }

  /// Reads and removes the claim file. On a read error the file stays.
  fn read_claim(&self) -> io::Result<Vec<String>> {
    let data = fs::read(&self.claim)?;
    let _ = fs::remove_file(&self.claim);
    Ok(
      String::from_utf8_lossy(&data)
        .lines()
        .map(str::to_string)
        .collect(),
    )
  }
}

impl DirectiveSource for CommandFile {
  fn poll(&mut self) -> Vec<Directive> {
    let lines = match self.take_lines() {
      Ok(lines) => lines,
      Err(err) => {
        warn!(
          "Failed to read command file {}: {err}",
          self.path.display()
        );
        return Vec::new();
      }
    };
    lines
      .iter()
      .filter_map(|line| match parse_directive(line) {
        Ok(directive) => directive,
        Err(err) => {
          warn!("Ignoring command: {err}");
          None
        }
      })
      .collect()
  }
}

/// In-process queue with the same vocabulary as the command file.
#[derive(Debug, Clone)]
pub struct ChannelSource {
  rx: Receiver<Directive>,
}

impl DirectiveSource for ChannelSource {
  fn poll(&mut self) -> Vec<Directive> {
    self.rx.try_iter().collect()
  }
}

/// Creates a bounded directive queue. Returns the issuer side and the source
/// to register with the daemon.
#[must_use]
pub fn make_directive_channel(capacity: usize) -> (Sender<Directive>, ChannelSource) {
  let (tx, rx) = bounded::<Directive>(capacity);
  (tx, ChannelSource { rx })
}

/// Appends one directive to a command file, as an external issuer would.
///
/// # Errors
/// Returns an error if the file cannot be opened or written.
pub fn enqueue(commands: &Path, directive: &Directive) -> Result<()> {
  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(commands)
    .with_context(|| format!("failed to open {}", commands.display()))?;
  file
    .write_all(format!("{directive}\n").as_bytes())
    .with_context(|| format!("failed to append to {}", commands.display()))?;
  Ok(())
}

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or(Duration::ZERO)
    .as_secs()
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
  let mut file = OpenOptions::new().create(true).append(true).open(path)?;
  file.write_all(line.as_bytes())
}

/// Append-only log of received chat lines: `<epoch-secs> <raw-line>`.
#[derive(Debug, Clone)]
pub struct Inbox {
  path: PathBuf,
}

impl Inbox {
  #[must_use]
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&self, line: &InboundLine) -> io::Result<()> {
    append_line(
      &self.path,
      &format!("{} {}\n", line.epoch_secs(), line.text),
    )
  }
}

/// Append-only log of lines written to the server: `<epoch-secs> -> <line>`.
#[derive(Debug, Clone)]
pub struct Outbox {
  path: PathBuf,
}

impl Outbox {
  #[must_use]
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn append(&self, line: &str) -> io::Result<()> {
    append_line(&self.path, &format!("{} -> {line}\n", now_secs()))
  }
}

/// Lifecycle state published in `status.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
  Starting,
  Connected {
    host: String,
    port: u16,
    nickname: String,
    channel: String,
  },
  Reconnecting,
  Error(String),
  Stopped,
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Starting => f.write_str("STARTING"),
      Self::Connected {
        host,
        port,
        nickname,
        channel,
      } => write!(f, "CONNECTED: {host}:{port} as {nickname} in {channel}"),
      Self::Reconnecting => f.write_str("RECONNECTING"),
      Self::Error(reason) => write!(f, "ERROR: {reason}"),
      Self::Stopped => f.write_str("STOPPED"),
    }
  }
}

/// Single-line status file, replaced atomically on each write.
#[derive(Debug, Clone)]
pub struct StatusFile {
  path: PathBuf,
}

impl StatusFile {
  #[must_use]
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn write(&self, status: &Status) -> io::Result<()> {
    let mut tmp = OsString::from(self.path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, format!("{status}\n"))?;
    fs::rename(&tmp, &self.path)
  }

  /// Current status line, or `None` if the daemon never ran here.
  pub fn read(&self) -> io::Result<Option<String>> {
    match fs::read_to_string(&self.path) {
      Ok(s) => Ok(Some(s.trim_end().to_string())),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// Locations of the control files inside one control directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPaths {
  dir: PathBuf,
}

impl ControlPaths {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  #[must_use]
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  #[must_use]
  pub fn commands(&self) -> PathBuf {
    self.dir.join("commands.txt")
  }

  #[must_use]
  pub fn inbox(&self) -> PathBuf {
    self.dir.join("inbox.txt")
  }

  #[must_use]
  pub fn outbox(&self) -> PathBuf {
    self.dir.join("outbox.txt")
  }

  #[must_use]
  pub fn status(&self) -> PathBuf {
    self.dir.join("status.txt")
  }

  /// Creates the control directory if missing.
  ///
  /// # Errors
  /// Returns an error if the directory cannot be created.
  pub fn ensure_dir(&self) -> Result<()> {
    fs::create_dir_all(&self.dir)
      .with_context(|| format!("failed to create control dir {}", self.dir.display()))
  }
}
