//! STOMP 1.2 frame codec and room destination naming.
//!
//! Frames travel as WebSocket text messages, one frame per message. A
//! message holding only end-of-line characters is a heartbeat.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::RoomId;

/// Destination prefix clients subscribe to
pub const TOPIC_PREFIX: &str = "/topic/room/";
/// Destination prefix clients publish to
pub const APP_PREFIX: &str = "/app/room/";
/// Protocol version sent in `accept-version` and `version`
pub const STOMP_VERSION: &str = "1.2";

/// Subscription topic for a room
pub fn room_topic(room: &RoomId) -> String {
    format!("{}{}", TOPIC_PREFIX, room)
}

/// Publish destination for a room
pub fn room_destination(room: &RoomId) -> String {
    format!("{}{}", APP_PREFIX, room)
}

/// Extract the room from either a topic or a publish destination
pub fn room_from_destination(destination: &str) -> Option<RoomId> {
    let id = destination
        .strip_prefix(TOPIC_PREFIX)
        .or_else(|| destination.strip_prefix(APP_PREFIX))?;
    if id.trim().is_empty() {
        return None;
    }
    Some(RoomId::new(id))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("missing frame terminator")]
    Unterminated,
    #[error("invalid content-length: {0}")]
    ContentLength(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heart-beat intervals in milliseconds, as carried by the `heart-beat` header.
///
/// `send_ms` is how often this side can send, `recv_ms` how often it wants
/// to receive. Zero disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub send_ms: u64,
    pub recv_ms: u64,
}

impl Heartbeat {
    pub fn new(send_ms: u64, recv_ms: u64) -> Self {
        Self { send_ms, recv_ms }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (send, recv) = value.split_once(',')?;
        Some(Self {
            send_ms: send.trim().parse().ok()?,
            recv_ms: recv.trim().parse().ok()?,
        })
    }

    pub fn to_header_value(&self) -> String {
        format!("{},{}", self.send_ms, self.recv_ms)
    }

    /// Negotiate effective intervals from our offer and the peer's offer.
    ///
    /// Returns `(outgoing, incoming)`; `None` means disabled.
    pub fn negotiate(&self, peer: &Heartbeat) -> (Option<Duration>, Option<Duration>) {
        let outgoing = if self.send_ms == 0 || peer.recv_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.send_ms.max(peer.recv_ms)))
        };
        let incoming = if self.recv_ms == 0 || peer.send_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.recv_ms.max(peer.send_ms)))
        };
        (outgoing, incoming)
    }
}

/// A single STOMP frame with a text body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, token: Option<&str>, heartbeat: Heartbeat) -> Self {
        let frame = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", heartbeat.to_header_value());
        match token {
            Some(token) => frame.header("Authorization", format!("Bearer {}", token)),
            None => frame,
        }
    }

    pub fn connected(heartbeat: Heartbeat) -> Self {
        Frame::new(Command::Connected)
            .header("version", STOMP_VERSION)
            .header("heart-beat", heartbeat.to_header_value())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, json_body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(json_body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn error(message: &str, detail: impl Into<String>) -> Self {
        Frame::new(Command::Error)
            .header("message", message)
            .with_body(detail)
    }

    /// Serialize into wire text, terminated by NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from wire text.
    ///
    /// Returns `Ok(None)` for heartbeats (text made only of EOLs).
    pub fn decode(text: &str) -> Result<Option<Frame>, FrameError> {
        let text = text.trim_start_matches(&['\r', '\n'][..]);
        if text.is_empty() {
            return Ok(None);
        }

        let (head, rest) = match text.find("\n\n") {
            Some(idx) => (&text[..idx], &text[idx + 2..]),
            None => match text.find("\r\n\r\n") {
                Some(idx) => (&text[..idx], &text[idx + 4..]),
                None => return Err(FrameError::Unterminated),
            },
        };

        let mut lines = head.lines();
        let command_line = lines.next().ok_or(FrameError::Empty)?;
        let command: Command = command_line.trim_end_matches('\r').parse()?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        frame.body = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::ContentLength(len.to_string()))?;
                let body = rest.get(..len).ok_or(FrameError::Unterminated)?;
                body.to_string()
            }
            None => {
                let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
                rest[..end].to_string()
            }
        };

        Ok(Some(frame))
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
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
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_encodes_and_decodes() {
        let frame = Frame::send("/app/room/42", r#"{"content":"hi"}"#);
        let wire = frame.encode();
        assert!(wire.starts_with("SEND\ndestination:/app/room/42\n"));
        assert!(wire.ends_with("{\"content\":\"hi\"}\0"));

        let decoded = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn header_values_are_escaped() {
        let frame = Frame::new(Command::Message).header("note", "a:b\nc\\d");
        let wire = frame.encode();
        assert!(wire.contains("note:a\\cb\\nc\\\\d\n"));
        let decoded = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded.get("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let frame = Frame::connect("localhost:8080", Some("tok"), Heartbeat::new(10000, 10000));
        let wire = frame.encode();
        assert!(wire.contains("host:localhost:8080\n"));
        assert!(wire.contains("Authorization:Bearer tok\n"));
        let decoded = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded.get("host"), Some("localhost:8080"));
    }

    #[test]
    fn heartbeat_only_text_is_not_a_frame() {
        assert_eq!(Frame::decode("\n").unwrap(), None);
        assert_eq!(Frame::decode("\r\n").unwrap(), None);
    }

    #[test]
    fn content_length_bounds_the_body() {
        let wire = "MESSAGE\ncontent-length:2\n\nhi\0";
        let frame = Frame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.body, "hi");
    }

    #[test]
    fn first_repeated_header_wins() {
        let wire = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = Frame::decode(wire).unwrap().unwrap();
        assert_eq!(frame.get("foo"), Some("first"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Frame::decode("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand(_))
        ));
        assert_eq!(Frame::decode("SEND\nno-colon\n\n\0"), Err(FrameError::MalformedHeader("no-colon".into())));
        assert_eq!(Frame::decode("SEND\n\nbody"), Err(FrameError::Unterminated));
    }

    #[test]
    fn heartbeat_negotiation() {
        let ours = Heartbeat::new(10000, 10000);
        let (out, inc) = ours.negotiate(&Heartbeat::new(5000, 20000));
        assert_eq!(out, Some(Duration::from_millis(20000)));
        assert_eq!(inc, Some(Duration::from_millis(10000)));

        let (out, inc) = ours.negotiate(&Heartbeat::new(0, 0));
        assert_eq!((out, inc), (None, None));
    }

    #[test]
    fn destinations_map_to_rooms() {
        let room = RoomId::from(42u64);
        assert_eq!(room_topic(&room), "/topic/room/42");
        assert_eq!(room_from_destination("/topic/room/42"), Some(room.clone()));
        assert_eq!(room_from_destination("/app/room/42"), Some(room));
        assert_eq!(room_from_destination("/queue/other"), None);
        assert_eq!(room_from_destination("/topic/room/"), None);
    }
}
