mod common;

use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use irc_agent::config::ServerConfig;
use irc_agent::connection::{ConnectionManager, TcpConnector};
use irc_agent::control::{
  CommandFile, Directive, Inbox, Outbox, StatusFile, enqueue, make_directive_channel,
};
use irc_agent::daemon::{DaemonBuilder, LoopTiming};
use irc_agent::error::ConnectError;
use irc_agent::protocol::{ChatMessage, Outbound};

use crate::common::{FakeIrcServer, wait_until};

fn server_config(port: u16) -> ServerConfig {
  ServerConfig {
    host: "127.0.0.1".to_string(),
    port,
    nickname: "agent".to_string(),
    channel: "#agents".to_string(),
  }
}

fn builder(port: u16, dir: &Path) -> DaemonBuilder {
  let conn = ConnectionManager::new(
    server_config(port),
    Box::new(TcpConnector::new(Duration::from_secs(2))),
    Duration::from_secs(5),
  )
  .with_outbox(Outbox::new(dir.join("outbox.txt")));
  let timing = LoopTiming {
    receive_timeout: Duration::from_millis(20),
    reconnect_backoff: Duration::from_millis(50),
    keepalive_idle: None,
  };
  DaemonBuilder::new(conn, Inbox::new(dir.join("inbox.txt")), timing)
    .source(CommandFile::new(dir.join("commands.txt")))
    .status_file(StatusFile::new(dir.join("status.txt")))
}

fn spawn(builder: DaemonBuilder) -> (Sender<Directive>, JoinHandle<()>) {
  let (tx, source) = make_directive_channel(16);
  let mut daemon = builder.source(source).start().expect("first connect");
  let handle = thread::spawn(move || daemon.run());
  (tx, handle)
}

fn read(dir: &Path, name: &str) -> String {
  std::fs::read_to_string(dir.join(name)).unwrap_or_default()
}

#[test]
fn registers_then_joins_channel() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let (tx, handle) = spawn(builder(server.port(), dir.path()));

  assert!(wait_until(|| server.has_received("JOIN #agents")));
  assert_eq!(
    server.received()[..3],
    ["NICK agent", "USER agent 0 * :agent", "JOIN #agents"]
  );
  let connected = format!("CONNECTED: 127.0.0.1:{} as agent in #agents", server.port());
  assert!(wait_until(|| read(dir.path(), "status.txt").trim_end() == connected));

  tx.send(Directive::Stop).unwrap();
  handle.join().unwrap();
}

#[test]
fn answers_server_ping() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let (tx, handle) = spawn(builder(server.port(), dir.path()));
  assert!(wait_until(|| server.has_received("JOIN #agents")));

  server.send("PING :server123");

  assert!(wait_until(|| server.has_received("PONG :server123")));
  tx.send(Directive::Stop).unwrap();
  handle.join().unwrap();
  assert_eq!(server.count_received("PONG :server123"), 1);
}

#[test]
fn channel_message_is_appended_to_inbox() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let (tx, handle) = spawn(builder(server.port(), dir.path()));
  assert!(wait_until(|| server.has_received("JOIN #agents")));

  server.send(":bob!u@h PRIVMSG #agents :hi");
  server.send("PRIVMSG");

  assert!(wait_until(|| read(dir.path(), "inbox.txt").contains("PRIVMSG #agents :hi")));
  tx.send(Directive::Stop).unwrap();
  handle.join().unwrap();

  let inbox = read(dir.path(), "inbox.txt");
  let records: Vec<&str> = inbox.lines().collect();
  assert_eq!(records.len(), 1);
  assert!(records[0].ends_with(" :bob!u@h PRIVMSG #agents :hi"));
}

#[test]
fn command_file_drives_send_and_quit() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let (_tx, handle) = spawn(builder(server.port(), dir.path()));
  assert!(wait_until(|| server.has_received("JOIN #agents")));

  let commands = dir.path().join("commands.txt");
  enqueue(&commands, &Directive::send("#agents", "Hello")).unwrap();
  assert!(wait_until(|| server.has_received("PRIVMSG #agents :Hello")));
  enqueue(&commands, &Directive::Stop).unwrap();
  handle.join().unwrap();

  assert!(wait_until(|| server.has_received("QUIT :Daemon stopped")));
  assert_eq!(server.count_received("PRIVMSG #agents :Hello"), 1);
  assert_eq!(read(dir.path(), "status.txt").trim_end(), "STOPPED");
  assert!(read(dir.path(), "outbox.txt").contains(" -> PRIVMSG #agents :Hello"));
}

#[test]
fn reconnects_after_server_hangs_up() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let (tx, handle) = spawn(builder(server.port(), dir.path()));
  assert!(wait_until(|| server.has_received("JOIN #agents")));

  server.drop_clients();

  assert!(wait_until(|| server.count_received("JOIN #agents") == 2));
  assert_eq!(server.connections(), 2);

  // The new session is fully usable.
  tx.send(Directive::send("#agents", "back")).unwrap();
  assert!(wait_until(|| server.has_received("PRIVMSG #agents :back")));
  tx.send(Directive::Stop).unwrap();
  handle.join().unwrap();
}

#[test]
fn handler_replies_go_to_reply_target() {
  let server = FakeIrcServer::start();
  let dir = tempfile::tempdir().unwrap();
  let builder = builder(server.port(), dir.path())
    .handler(|msg: &ChatMessage| vec![Outbound::privmsg(msg.reply_target(), &msg.body.to_uppercase())]);
  let (tx, handle) = spawn(builder);
  assert!(wait_until(|| server.has_received("JOIN #agents")));

  server.send(":bob!u@h PRIVMSG agent :psst");

  assert!(wait_until(|| server.has_received("PRIVMSG bob :PSST")));
  tx.send(Directive::Stop).unwrap();
  handle.join().unwrap();
}

#[test]
fn refused_first_connect_is_an_error() {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  let dir = tempfile::tempdir().unwrap();

  let result = builder(port, dir.path()).start();

  assert!(matches!(result, Err(ConnectError::Io { .. })));
  assert!(read(dir.path(), "status.txt").starts_with("ERROR: "));
}
