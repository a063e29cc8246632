//! STOMP 1.2 frame encoding and incremental decoding.
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) on every command except
//! `CONNECT` and `CONNECTED`. A `content-length` header, when present, bounds
//! the body in octets; otherwise the body runs to the first NUL. Bare EOLs
//! between frames are heart-beats.

use std::fmt;

use crate::error::{RealtimeError, Result};

/// Largest frame the decoder accepts, in octets of buffered text.
///
/// A declared `content-length` above this, or an unterminated frame that
/// outgrows it, is a protocol error.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// STOMP frame commands used by the client and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// The command line as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Parse a command line.
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame.
///
/// Headers keep their wire order. Repeated headers are allowed; per STOMP 1.2
/// only the first occurrence is significant, which is what [`Frame::header`]
/// returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Encode to wire form, adding `content-length` for non-empty bodies.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(':');
            push_header_part(&mut out, value, escape);
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode exactly one frame from a complete message.
    ///
    /// Returns `Ok(None)` for a heart-beat (a message made only of EOLs).
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Protocol`] if the message is not a complete,
    /// well-formed frame.
    pub fn decode(raw: &str) -> Result<Option<Self>> {
        let mut reader = FrameReader::new();
        reader.push(raw);
        match reader.next_frame()? {
            Some(frame) => Ok(Some(frame)),
            None if reader.is_empty() => Ok(None),
            None => Err(RealtimeError::Protocol("incomplete frame".into())),
        }
    }
}

fn push_header_part(out: &mut String, raw: &str, escape: bool) {
    if !escape {
        out.push_str(raw);
        return;
    }
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(RealtimeError::Protocol(format!(
                    "undefined header escape \\{other}"
                )))
            }
            None => return Err(RealtimeError::Protocol("dangling header escape".into())),
        }
    }
    Ok(out)
}

/// Incremental decoder for a stream of text messages.
///
/// Brokers are free to split a frame across transport messages or to pack
/// several frames into one, so the STOMP link feeds every received message
/// through a reader and drains whole frames out of it.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received text.
    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
    }

    /// `true` if no undecoded bytes remain (heart-beats ignored).
    pub fn is_empty(&self) -> bool {
        self.buf.trim_start_matches(['\r', '\n']).is_empty()
    }

    /// Pop the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only heart-beats or an
    /// incomplete frame. On error the buffer is discarded so that one bad
    /// frame cannot wedge the reader.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Protocol`] for malformed frames and for an
    /// incomplete frame already larger than [`MAX_FRAME_BYTES`].
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let skipped = self.buf.len() - self.buf.trim_start_matches(['\r', '\n']).len();
        self.buf.drain(..skipped);
        if self.buf.is_empty() {
            return Ok(None);
        }

        match parse_frame(&self.buf) {
            Ok(Some((frame, consumed))) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Ok(None) if self.buf.len() > MAX_FRAME_BYTES => {
                self.buf.clear();
                Err(RealtimeError::Protocol(format!(
                    "frame exceeds {MAX_FRAME_BYTES} bytes"
                )))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }
}

/// Parse one frame from the front of `buf`, returning it plus the number of
/// bytes consumed, or `None` if more input is needed.
fn parse_frame(buf: &str) -> Result<Option<(Frame, usize)>> {
    let mut lines = Vec::new();
    let mut pos = 0;
    let body_start = loop {
        let Some(rel) = buf.get(pos..).and_then(|rest| rest.find('\n')) else {
            return Ok(None);
        };
        let line = buf.get(pos..pos + rel).unwrap_or_default();
        let line = line.strip_suffix('\r').unwrap_or(line);
        pos += rel + 1;
        if line.is_empty() {
            break pos;
        }
        lines.push(line);
    };

    let mut lines = lines.into_iter();
    let command_line = lines.next().unwrap_or_default();
    let command = Command::parse(command_line)
        .ok_or_else(|| RealtimeError::Protocol(format!("unknown command {command_line:?}")))?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RealtimeError::Protocol(format!("header without colon: {line:?}")))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| RealtimeError::Protocol(format!("bad content-length {value:?}")))
        })
        .transpose()?;

    let (body, consumed) = match content_length {
        Some(len) if len > MAX_FRAME_BYTES => {
            return Err(RealtimeError::Protocol(format!(
                "content-length {len} exceeds {MAX_FRAME_BYTES} bytes"
            )));
        }
        Some(len) => {
            let body_end = body_start
                .checked_add(len)
                .ok_or_else(|| RealtimeError::Protocol("content-length overflows".into()))?;
            if buf.len() <= body_end {
                return Ok(None);
            }
            let body = buf.get(body_start..body_end).ok_or_else(|| {
                RealtimeError::Protocol("content-length splits a UTF-8 character".into())
            })?;
            if buf.as_bytes().get(body_end) != Some(&0) {
                return Err(RealtimeError::Protocol(
                    "frame body not terminated by NUL".into(),
                ));
            }
            (body, body_end + 1)
        }
        None => {
            let Some(rel) = buf.get(body_start..).and_then(|rest| rest.find('\0')) else {
                return Ok(None);
            };
            let body = buf.get(body_start..body_start + rel).unwrap_or_default();
            (body, body_start + rel + 1)
        }
    };

    Ok(Some((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        consumed,
    )))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn encode_send_frame_adds_content_length() {
        let frame = Frame::new(Command::Send)
            .with_header("destination", "/topic/ABC123")
            .with_body(r#"{"event":"x"}"#);
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/topic/ABC123\ncontent-length:13\n\n{\"event\":\"x\"}\0"
        );
    }

    #[test]
    fn encode_empty_body_has_no_content_length() {
        let frame = Frame::new(Command::Disconnect).with_header("receipt", "r-1");
        assert_eq!(frame.encode(), "DISCONNECT\nreceipt:r-1\n\n\0");
    }

    #[test]
    fn header_values_are_escaped_except_on_connect() {
        let send = Frame::new(Command::Send).with_header("note", "a:b\nc\\d");
        assert!(send.encode().contains("note:a\\cb\\nc\\\\d\n"));

        let connect = Frame::new(Command::Connect).with_header("host", "a:b");
        assert!(connect.encode().contains("host:a:b\n"));
    }

    #[test]
    fn decode_message_frame() {
        let raw = "MESSAGE\ndestination:/topic/ABC123\nsubscription:sub-0\nmessage-id:7\n\n{\"event\":\"userUpdate\"}\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.header("subscription"), Some("sub-0"));
        assert_eq!(frame.body, "{\"event\":\"userUpdate\"}");
    }

    #[test]
    fn decode_unescapes_headers() {
        let raw = "MESSAGE\nnote:a\\cb\\nc\\\\d\n\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.header("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn decode_rejects_undefined_escape() {
        let err = Frame::decode("MESSAGE\nnote:\\t\n\n\0").unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[test]
    fn decode_accepts_crlf_line_endings() {
        let raw = "CONNECTED\r\nversion:1.2\r\n\r\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
    }

    #[test]
    fn first_repeated_header_wins() {
        let raw = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.header("foo"), Some("first"));
    }

    #[test]
    fn content_length_allows_nul_in_body() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn content_length_counts_octets() {
        let body = "ñandú";
        let raw = format!("MESSAGE\ncontent-length:{}\n\n{body}\0", body.len());
        let frame = Frame::decode(&raw).unwrap().unwrap();
        assert_eq!(frame.body, body);
    }

    #[test]
    fn content_length_that_splits_a_char_is_rejected() {
        let raw = "MESSAGE\ncontent-length:1\n\nñ\0";
        assert!(matches!(
            Frame::decode(raw),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn missing_nul_after_content_length_is_rejected() {
        let raw = "MESSAGE\ncontent-length:1\n\nab\0";
        assert!(matches!(
            Frame::decode(raw),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn heart_beat_decodes_to_none() {
        assert!(Frame::decode("\n").unwrap().is_none());
        assert!(Frame::decode("\r\n\n").unwrap().is_none());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Frame::decode("HELLO\n\n\0").unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[test]
    fn incomplete_frame_is_an_error_for_one_shot_decode() {
        assert!(Frame::decode("MESSAGE\nfoo:bar\n").is_err());
    }

    #[test]
    fn reader_reassembles_split_frames() {
        let mut reader = FrameReader::new();
        reader.push("MESSAGE\nsubscription:sub-1\n");
        assert!(reader.next_frame().unwrap().is_none());
        reader.push("\n{\"event\":");
        assert!(reader.next_frame().unwrap().is_none());
        reader.push("\"a\"}\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.body, "{\"event\":\"a\"}");
        assert!(reader.is_empty());
    }

    #[test]
    fn reader_splits_packed_frames_and_skips_heart_beats() {
        let mut reader = FrameReader::new();
        reader.push("\nMESSAGE\n\nfirst\0\n\nMESSAGE\n\nsecond\0\n");
        assert_eq!(reader.next_frame().unwrap().unwrap().body, "first");
        assert_eq!(reader.next_frame().unwrap().unwrap().body, "second");
        assert!(reader.next_frame().unwrap().is_none());
        assert!(reader.is_empty());
    }

    #[test]
    fn reader_recovers_after_malformed_frame() {
        let mut reader = FrameReader::new();
        reader.push("BOGUS\n\n\0");
        assert!(reader.next_frame().is_err());
        reader.push("RECEIPT\nreceipt-id:r-1\n\n\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.command, Command::Receipt);
    }

    #[test]
    fn content_length_near_usize_max_is_rejected() {
        let raw = format!("MESSAGE\ncontent-length:{}\n\nx\0", usize::MAX);
        let err = Frame::decode(&raw).unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(ref m) if m.contains("content-length")));
    }

    #[test]
    fn oversized_content_length_is_rejected_before_buffering() {
        let mut reader = FrameReader::new();
        reader.push(&format!(
            "MESSAGE\ncontent-length:{}\n\npartial",
            MAX_FRAME_BYTES + 1
        ));
        assert!(reader.next_frame().is_err());
        assert!(reader.is_empty());
    }

    #[test]
    fn unterminated_frame_is_capped() {
        let mut reader = FrameReader::new();
        reader.push("MESSAGE\nsubscription:sub-0\n\n");
        let chunk = "x".repeat(64 * 1024);
        let mut failed = false;
        for _ in 0..(MAX_FRAME_BYTES / chunk.len() + 2) {
            reader.push(&chunk);
            if reader.next_frame().is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "reader kept buffering past the frame cap");
        assert!(reader.is_empty());

        reader.push("RECEIPT\nreceipt-id:r-2\n\n\0");
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.header("receipt-id"), Some("r-2"));
    }

    #[test]
    fn encode_then_decode_preserves_frame() {
        let frame = Frame::new(Command::Subscribe)
            .with_header("id", "sub-3")
            .with_header("destination", "/topic/X:Y");
        let decoded = Frame::decode(&frame.encode()).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}
