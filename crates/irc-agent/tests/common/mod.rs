#![allow(dead_code)]
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use assert_cmd::Command;
use assert_cmd::cargo::CommandCargoExt as _;
use parking_lot::Mutex;
use tempfile::{Builder, TempDir};

/// Scratch control directory and config home for one test.
#[derive(Debug)]
pub struct TestEnv {
  temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = Builder::new()
      .prefix("irc-agent-test-")
      .tempdir()
      .expect("temp dir");
    std::fs::create_dir_all(temp.path().join("config")).expect("config home");
    Self { temp }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn control_dir(&self) -> PathBuf {
    self.temp.path().join("control")
  }

  pub fn read_control_file(&self, name: &str) -> String {
    std::fs::read_to_string(self.control_dir().join(name)).unwrap_or_default()
  }

  /// The binary, isolated from the user's config and environment.
  pub fn bin_cmd(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("irc-agent")?;
    cmd.env("XDG_CONFIG_HOME", self.temp.path().join("config"));
    cmd.env_remove("IRC_AGENT_CONTROL_DIR");
    cmd.arg("--control-dir").arg(self.control_dir());
    Ok(cmd)
  }

  /// Same as [`Self::bin_cmd`] but as a plain process for background runs.
  pub fn spawn_cmd(&self) -> Result<std::process::Command> {
    let mut cmd = std::process::Command::cargo_bin("irc-agent")?;
    cmd.env("XDG_CONFIG_HOME", self.temp.path().join("config"));
    cmd.env_remove("IRC_AGENT_CONTROL_DIR");
    cmd.arg("--control-dir").arg(self.control_dir());
    Ok(cmd)
  }
}

/// Polls `cond` until it holds or five seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + Duration::from_secs(5);
  while Instant::now() < deadline {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  cond()
}

/// Minimal IRC server on loopback: welcomes every `USER`, records every
/// received line and can push lines to, or hang up on, its clients.
pub struct FakeIrcServer {
  port: u16,
  received: Arc<Mutex<Vec<String>>>,
  clients: Arc<Mutex<Vec<TcpStream>>>,
  connections: Arc<AtomicUsize>,
}

impl FakeIrcServer {
  pub fn start() -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    let server = Self {
      port,
      received: Arc::default(),
      clients: Arc::default(),
      connections: Arc::default(),
    };

    let received = server.received.clone();
    let clients = server.clients.clone();
    let connections = server.connections.clone();
    thread::spawn(move || {
      for stream in listener.incoming() {
        let Ok(stream) = stream else { break };
        connections.fetch_add(1, Ordering::SeqCst);
        let Ok(writer) = stream.try_clone() else {
          continue;
        };
        clients.lock().push(writer);
        let received = received.clone();
        thread::spawn(move || serve_client(stream, &received));
      }
    });
    server
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn connections(&self) -> usize {
    self.connections.load(Ordering::SeqCst)
  }

  pub fn received(&self) -> Vec<String> {
    self.received.lock().clone()
  }

  pub fn has_received(&self, line: &str) -> bool {
    self.received.lock().iter().any(|l| l == line)
  }

  pub fn count_received(&self, line: &str) -> usize {
    self.received.lock().iter().filter(|l| *l == line).count()
  }

  /// Writes `line` to the most recent client.
  pub fn send(&self, line: &str) {
    let mut clients = self.clients.lock();
    let client = clients.last_mut().expect("no client connected");
    client
      .write_all(format!("{line}\r\n").as_bytes())
      .expect("write to client");
  }

  /// Hangs up on every connected client.
  pub fn drop_clients(&self) {
    for client in self.clients.lock().drain(..) {
      let _ = client.shutdown(Shutdown::Both);
    }
  }
}

fn serve_client(stream: TcpStream, received: &Mutex<Vec<String>>) {
  let Ok(mut writer) = stream.try_clone() else {
    return;
  };
  let mut nick = String::from("*");
  for line in BufReader::new(stream).lines() {
    let Ok(line) = line else { break };
    let line = line.trim_end_matches('\r').to_string();
    if let Some(n) = line.strip_prefix("NICK ") {
      nick = n.to_string();
    }
    let welcome = line.starts_with("USER ");
    received.lock().push(line);
    if welcome {
      let _ = writer.write_all(format!(":fake.irc 001 {nick} :Welcome\r\n").as_bytes());
    }
  }
}
