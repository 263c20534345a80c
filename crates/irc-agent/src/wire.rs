//! Line framing for the IRC wire format.
//!
//! Outgoing lines get the two-byte `\r\n` terminator appended. Incoming bytes
//! are accumulated in a [`LineDecoder`] that only yields a line once its
//! terminator has arrived, so a line split across several reads is emitted
//! exactly once.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

/// Terminator that ends every protocol line.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Longest partial line kept while waiting for its terminator.
pub const MAX_LINE_BYTES: usize = 8192;

/// Encodes one protocol line by appending the terminator.
#[must_use]
pub fn encode(line: &str) -> Vec<u8> {
  let mut out = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
  out.extend_from_slice(line.as_bytes());
  out.extend_from_slice(LINE_TERMINATOR);
  out
}

/// Splits `buffer` into its complete lines and the unconsumed remainder.
///
/// The remainder is a partial line whose terminator has not arrived yet and
/// must be prepended to the next read.
#[must_use]
pub fn decode(buffer: &[u8]) -> (Vec<String>, &[u8]) {
  let mut lines = Vec::new();
  let mut rest = buffer;
  while let Some(pos) = find_terminator(rest) {
    lines.push(bytes_to_text(&rest[..pos]));
    rest = &rest[pos + LINE_TERMINATOR.len()..];
  }
  (lines, rest)
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
  bytes
    .windows(LINE_TERMINATOR.len())
    .position(|w| w == LINE_TERMINATOR)
}

fn bytes_to_text(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).into_owned()
}

/// A decoded protocol line and the moment it was taken off the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLine {
  pub text: String,
  pub received_at: SystemTime,
}

impl InboundLine {
  #[must_use]
  pub fn new(text: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      received_at: SystemTime::now(),
    }
  }

  /// Arrival time as whole seconds since the Unix epoch.
  #[must_use]
  pub fn epoch_secs(&self) -> u64 {
    self
      .received_at
      .duration_since(UNIX_EPOCH)
      .unwrap_or(Duration::ZERO)
      .as_secs()
  }
}

/// Stateful decoder that keeps partial lines between reads.
///
/// A line longer than [`MAX_LINE_BYTES`] is dropped up to and including its
/// terminator.
#[derive(Debug, Default)]
pub struct LineDecoder {
  buf: Vec<u8>,
  /// Prefix of `buf` already searched for a terminator.
  scanned: usize,
  /// Set while the rest of an oversized line is being skipped.
  discarding: bool,
}

impl LineDecoder {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends freshly read bytes.
  pub fn push(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  /// Takes the next complete line off the front of the buffer, if any.
  pub fn next_line(&mut self) -> Option<InboundLine> {
    loop {
      // Step back one byte so a terminator split across pushes is found.
      let start = self.scanned.saturating_sub(LINE_TERMINATOR.len() - 1);
      let Some(found) = find_terminator(&self.buf[start..]) else {
        self.scanned = self.buf.len();
        self.cap_partial_line();
        return None;
      };
      let pos = start + found;
      let skip = std::mem::take(&mut self.discarding) || pos > MAX_LINE_BYTES;
      let text = (!skip).then(|| bytes_to_text(&self.buf[..pos]));
      self.buf.drain(..pos + LINE_TERMINATOR.len());
      self.scanned = 0;
      match text {
        Some(text) => return Some(InboundLine::new(text)),
        None => debug!("Dropped line longer than {MAX_LINE_BYTES} bytes"),
      }
    }
  }

  fn cap_partial_line(&mut self) {
    if self.buf.len() <= MAX_LINE_BYTES {
      return;
    }
    debug!(
      "Discarding oversized partial line ({} bytes buffered)",
      self.buf.len()
    );
    let keep = usize::from(self.buf.last() == Some(&b'\r'));
    let cut = self.buf.len() - keep;
    self.buf.drain(..cut);
    self.scanned = self.buf.len();
    self.discarding = true;
  }

  /// Iterates over the complete lines currently buffered.
  ///
  /// The iterator ends when only a partial line is left; calling `lines`
  /// again after another `push` picks up where it stopped.
  pub fn lines(&mut self) -> Lines<'_> {
    Lines { decoder: self }
  }

  /// Bytes not yet handed out as lines.
  #[must_use]
  pub fn remainder(&self) -> &[u8] {
    &self.buf
  }

  /// Moves all buffered bytes out, leaving the decoder empty.
  pub fn take_remainder(&mut self) -> Vec<u8> {
    self.scanned = 0;
    self.discarding = false;
    std::mem::take(&mut self.buf)
  }

  /// Drops everything buffered, including a partial line.
  pub fn reset(&mut self) {
    self.buf.clear();
    self.scanned = 0;
    self.discarding = false;
  }
}

/// Draining iterator returned by [`LineDecoder::lines`].
pub struct Lines<'a> {
  decoder: &'a mut LineDecoder,
}

impl Iterator for Lines<'_> {
  type Item = InboundLine;

  fn next(&mut self) -> Option<Self::Item> {
    self.decoder.next_line()
  }
}
