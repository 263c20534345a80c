//! Interpretation of decoded IRC lines.
//!
//! The handler is stateless per line. The only context it reads is the
//! nickname and channel the session registered with.

use std::fmt;

use log::{debug, info, warn};

use crate::error::MalformedLine;

/// Keep-alive probe sent by servers (and by us when idle).
pub const PING: &str = "PING";
/// Reply form of [`PING`].
pub const PONG: &str = "PONG";
/// Chat message command.
pub const PRIVMSG: &str = "PRIVMSG";
/// `RPL_WELCOME`: registration accepted.
pub const RPL_WELCOME: &str = "001";

/// A command written to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
  Nick(String),
  /// `USER` registration with the fixed mode and realname.
  User(String),
  Join(String),
  Privmsg { target: String, text: String },
  /// Complete keep-alive reply line, e.g. `PONG :server123`.
  Pong(String),
  /// Keep-alive probe carrying the given token.
  Ping(String),
  Quit(String),
  Raw(String),
}

impl Outbound {
  /// Chat send. Line breaks in either field are removed so the command
  /// always stays a single wire line.
  #[must_use]
  pub fn privmsg(target: &str, text: &str) -> Self {
    Self::Privmsg {
      target: strip_line_breaks(target),
      text: strip_line_breaks(text),
    }
  }

  /// Arbitrary protocol line, e.g. from a [`MessageHandler`]. Line breaks
  /// are removed like in [`Outbound::privmsg`].
  #[must_use]
  pub fn raw(line: &str) -> Self {
    Self::Raw(strip_line_breaks(line))
  }

  #[must_use]
  pub fn quit(reason: &str) -> Self {
    Self::Quit(strip_line_breaks(reason))
  }
}

impl fmt::Display for Outbound {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Nick(nick) => write!(f, "NICK {nick}"),
      Self::User(nick) => write!(f, "USER {nick} 0 * :{nick}"),
      Self::Join(channel) => write!(f, "JOIN {channel}"),
      Self::Privmsg { target, text } => write!(f, "{PRIVMSG} {target} :{text}"),
      Self::Pong(line) | Self::Raw(line) => f.write_str(line),
      Self::Ping(token) => write!(f, "{PING} :{token}"),
      Self::Quit(reason) => write!(f, "QUIT :{reason}"),
    }
  }
}

fn strip_line_breaks(s: &str) -> String {
  s.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Read-only identity of the session a line arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
  pub nickname: String,
  pub channel: String,
}

/// A well-formed `PRIVMSG` received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
  pub sender: String,
  pub target: String,
  pub body: String,
  /// The full line as received, without terminator.
  pub raw: String,
  /// Addressed to our nickname rather than a channel.
  pub is_direct: bool,
}

impl ChatMessage {
  /// Where a reply should go: the sender for direct messages, else the target.
  #[must_use]
  pub fn reply_target(&self) -> &str {
    if self.is_direct {
      &self.sender
    } else {
      &self.target
    }
  }
}

/// Positional parse of `:sender!user@host PRIVMSG <target> :<body>`.
pub fn parse_privmsg(line: &str) -> Result<ChatMessage, MalformedLine> {
  let malformed = || MalformedLine {
    command: PRIVMSG,
    line: line.to_string(),
  };
  let mut fields = line.splitn(4, ' ');
  let (Some(prefix), Some(command), Some(target), Some(rest)) =
    (fields.next(), fields.next(), fields.next(), fields.next())
  else {
    return Err(malformed());
  };
  let Some(prefix) = prefix.strip_prefix(':') else {
    return Err(malformed());
  };
  if command != PRIVMSG || target.is_empty() {
    return Err(malformed());
  }
  let sender = prefix.split_once('!').map_or(prefix, |(nick, _)| nick);
  if sender.is_empty() {
    return Err(malformed());
  }
  let body = rest.strip_prefix(':').unwrap_or(rest);
  Ok(ChatMessage {
    sender: sender.to_string(),
    target: target.to_string(),
    body: body.to_string(),
    raw: line.to_string(),
    is_direct: false,
  })
}

/// True for a line whose command token is the `001` welcome numeric.
#[must_use]
pub fn is_welcome(line: &str) -> bool {
  line.split(' ').nth(1) == Some(RPL_WELCOME)
}

/// True for a line that begins with the keep-alive probe token.
#[must_use]
pub fn is_ping(line: &str) -> bool {
  line == PING || line.starts_with("PING ")
}

/// The reply for a keep-alive probe: same line, `PING` swapped for `PONG`.
#[must_use]
pub fn pong_for(line: &str) -> Outbound {
  Outbound::Pong(line.replacen(PING, PONG, 1))
}

/// What the daemon should do with one received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
  /// Send this immediately.
  Reply(Outbound),
  /// Append to the inbox and offer to the message handler.
  Chat(ChatMessage),
  Welcome,
  Membership {
    nick: String,
    channel: String,
    joined: bool,
  },
  ServerError(String),
  /// Looked like a chat line but did not parse.
  Drop(MalformedLine),
  Ignore,
}

#[derive(Debug, Clone)]
pub struct ProtocolHandler {
  ctx: SessionContext,
}

impl ProtocolHandler {
  #[must_use]
  pub fn new(ctx: SessionContext) -> Self {
    Self { ctx }
  }

  #[must_use]
  pub fn context(&self) -> &SessionContext {
    &self.ctx
  }

  /// Classifies `line` and logs anything that is not acted on.
  #[must_use]
  pub fn handle(&self, line: &str) -> Reaction {
    let reaction = self.classify(line);
    match &reaction {
      Reaction::Drop(err) => debug!("Dropping {err}"),
      Reaction::Ignore => debug!("<- {line}"),
      Reaction::Membership {
        nick,
        channel,
        joined: true,
      } => info!("{nick} joined {channel}"),
      Reaction::Membership {
        nick,
        channel,
        joined: false,
      } => info!("{nick} left {channel}"),
      Reaction::ServerError(text) => warn!("Server error: {text}"),
      Reaction::Reply(_) | Reaction::Chat(_) | Reaction::Welcome => {}
    }
    reaction
  }

  fn classify(&self, line: &str) -> Reaction {
    if is_ping(line) {
      return Reaction::Reply(pong_for(line));
    }
    if line.contains(PRIVMSG) {
      return match parse_privmsg(line) {
        Ok(mut msg) => {
          msg.is_direct = msg.target.eq_ignore_ascii_case(&self.ctx.nickname);
          Reaction::Chat(msg)
        }
        Err(err) => Reaction::Drop(err),
      };
    }
    if is_welcome(line) {
      return Reaction::Welcome;
    }
    if let Some(text) = line.strip_prefix("ERROR") {
      return Reaction::ServerError(text.trim_start_matches([' ', ':']).to_string());
    }
    parse_membership(line).unwrap_or(Reaction::Ignore)
  }
}

fn parse_membership(line: &str) -> Option<Reaction> {
  let mut fields = line.split(' ');
  let prefix = fields.next()?.strip_prefix(':')?;
  let joined = match fields.next()? {
    "JOIN" => true,
    "PART" => false,
    _ => return None,
  };
  let channel = fields.next()?;
  let channel = channel.strip_prefix(':').unwrap_or(channel);
  let nick = prefix.split_once('!').map_or(prefix, |(nick, _)| nick);
  Some(Reaction::Membership {
    nick: nick.to_string(),
    channel: channel.to_string(),
    joined,
  })
}

/// Extension point for reacting to chat messages.
///
/// Called for every chat message not sent by our own nickname, after it has
/// been recorded in the inbox. Returned commands are sent right away.
pub trait MessageHandler: Send {
  fn on_message(&mut self, msg: &ChatMessage) -> Vec<Outbound>;
}

/// Handler that never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReply;

impl MessageHandler for NoReply {
  fn on_message(&mut self, _msg: &ChatMessage) -> Vec<Outbound> {
    Vec::new()
  }
}

impl<F> MessageHandler for F
where
  F: FnMut(&ChatMessage) -> Vec<Outbound> + Send,
{
  fn on_message(&mut self, msg: &ChatMessage) -> Vec<Outbound> {
    self(msg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn handler() -> ProtocolHandler {
    ProtocolHandler::new(SessionContext {
      nickname: "agent".to_string(),
      channel: "#agents".to_string(),
    })
  }

  #[test]
  fn outbound_lines_match_wire_format() {
    assert_eq!(Outbound::Nick("agent".into()).to_string(), "NICK agent");
    assert_eq!(
      Outbound::User("agent".into()).to_string(),
      "USER agent 0 * :agent"
    );
    assert_eq!(Outbound::Join("#agents".into()).to_string(), "JOIN #agents");
    assert_eq!(
      Outbound::privmsg("#agents", "Hello").to_string(),
      "PRIVMSG #agents :Hello"
    );
    assert_eq!(Outbound::quit("bye").to_string(), "QUIT :bye");
    assert_eq!(
      Outbound::Ping("keepalive".into()).to_string(),
      "PING :keepalive"
    );
  }

  #[test]
  fn privmsg_constructor_strips_line_breaks() {
    let cmd = Outbound::privmsg("#a", "one\r\nQUIT :injected");
    assert_eq!(cmd.to_string(), "PRIVMSG #a :oneQUIT :injected");
  }

  #[test]
  fn raw_constructor_strips_line_breaks() {
    let cmd = Outbound::raw("MODE #a +m\r\nQUIT :injected\n");
    assert_eq!(cmd.to_string(), "MODE #a +mQUIT :injected");
  }

  #[test]
  fn ping_gets_token_substituted_pong() {
    assert_eq!(
      handler().handle("PING :server123"),
      Reaction::Reply(Outbound::Pong("PONG :server123".into()))
    );
  }

  #[test]
  fn ping_reply_only_swaps_leading_token() {
    assert_eq!(
      pong_for("PING :PING").to_string(),
      "PONG :PING".to_string()
    );
  }

  #[test]
  fn lookalike_command_is_not_a_ping() {
    assert!(!is_ping("PINGER :x"));
    assert!(is_ping("PING"));
  }

  #[test]
  fn channel_privmsg_is_parsed() {
    let Reaction::Chat(msg) = handler().handle(":bob!u@h PRIVMSG #agents :hi") else {
      panic!("expected chat");
    };
    assert_eq!(msg.sender, "bob");
    assert_eq!(msg.target, "#agents");
    assert_eq!(msg.body, "hi");
    assert_eq!(msg.raw, ":bob!u@h PRIVMSG #agents :hi");
    assert!(!msg.is_direct);
    assert_eq!(msg.reply_target(), "#agents");
  }

  #[test]
  fn body_keeps_inner_colons_and_spaces() {
    let msg = parse_privmsg(":bob!u@h PRIVMSG #agents :time: 12:30 ok").unwrap();
    assert_eq!(msg.body, "time: 12:30 ok");
  }

  #[test]
  fn direct_message_replies_to_sender() {
    let Reaction::Chat(msg) = handler().handle(":bob!u@h PRIVMSG Agent :psst") else {
      panic!("expected chat");
    };
    assert!(msg.is_direct);
    assert_eq!(msg.reply_target(), "bob");
  }

  #[test]
  fn bare_privmsg_is_dropped() {
    assert!(matches!(handler().handle("PRIVMSG"), Reaction::Drop(_)));
  }

  #[test]
  fn privmsg_with_too_few_fields_is_dropped() {
    assert!(matches!(
      handler().handle(":bob!u@h PRIVMSG #agents"),
      Reaction::Drop(_)
    ));
  }

  #[test]
  fn marker_in_wrong_position_is_dropped() {
    assert!(matches!(
      handler().handle(":srv NOTICE agent :say PRIVMSG please"),
      Reaction::Drop(_)
    ));
  }

  #[test]
  fn welcome_is_recognised() {
    assert_eq!(
      handler().handle(":irc.local 001 agent :Welcome to IRC"),
      Reaction::Welcome
    );
    assert!(!is_welcome(":irc.local 002 agent :Your host"));
  }

  #[test]
  fn join_and_part_are_reported() {
    assert_eq!(
      handler().handle(":alice!a@h JOIN :#agents"),
      Reaction::Membership {
        nick: "alice".into(),
        channel: "#agents".into(),
        joined: true,
      }
    );
    assert_eq!(
      handler().handle(":alice!a@h PART #agents"),
      Reaction::Membership {
        nick: "alice".into(),
        channel: "#agents".into(),
        joined: false,
      }
    );
  }

  #[test]
  fn error_line_is_surfaced() {
    assert_eq!(
      handler().handle("ERROR :Closing Link: agent (Ping timeout)"),
      Reaction::ServerError("Closing Link: agent (Ping timeout)".into())
    );
  }

  #[test]
  fn other_lines_are_ignored() {
    assert_eq!(
      handler().handle(":irc.local 372 agent :- motd"),
      Reaction::Ignore
    );
  }

  #[test]
  fn closures_are_message_handlers() {
    let mut replies = 0;
    let mut hook = |msg: &ChatMessage| {
      replies += 1;
      vec![Outbound::privmsg(msg.reply_target(), "ack")]
    };
    let msg = parse_privmsg(":bob!u@h PRIVMSG #agents :hi").unwrap();
    let out = hook.on_message(&msg);
    assert_eq!(out, vec![Outbound::privmsg("#agents", "ack")]);
    assert_eq!(NoReply.on_message(&msg), Vec::new());
    drop(hook);
    assert_eq!(replies, 1);
  }
}
