//! Shared data models for chat rooms and messages.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// --- Identity ---

/// Opaque room identifier.
///
/// Rooms arrive as strings from some endpoints and as numbers from others, so
/// the id is always stored as a trimmed string and compared that way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawRoomId", into = "String")]
pub struct RoomId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRoomId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.len() == id.len() {
            Self(id)
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<RawRoomId> for RoomId {
    fn from(raw: RawRoomId) -> Self {
        match raw {
            RawRoomId::Text(s) => RoomId::new(s),
            RawRoomId::Signed(n) => RoomId(n.to_string()),
            RawRoomId::Unsigned(n) => RoomId(n.to_string()),
        }
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId::new(s)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId::new(s)
    }
}

impl From<u64> for RoomId {
    fn from(n: u64) -> Self {
        RoomId(n.to_string())
    }
}

impl From<i64> for RoomId {
    fn from(n: i64) -> Self {
        RoomId(n.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the conversation a message came from.
///
/// Only used for message alignment, never for authorization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    #[default]
    User,
    Owner,
}

impl SenderRole {
    /// Parse the role spellings seen on the wire (`USER`, `customer`, `OWNER`, `store`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "customer" => Some(SenderRole::User),
            "owner" | "store" | "seller" => Some(SenderRole::Owner),
            _ => None,
        }
    }
}

// --- Rooms ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: RoomId,
    /// Display name of the other participant
    pub counterpart_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

// --- Messaging ---

/// Canonical chat message.
///
/// Produced by the client normalizer from broker frames and by the
/// server for history pages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: RoomId,
    pub content: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display: Option<String>,
    #[serde(default)]
    pub sender_role: SenderRole,
    /// ISO-8601 timestamp as received
    pub timestamp: String,
    #[serde(default)]
    pub is_optimistic: bool,
    /// Correlation id of the outbound message this echoes, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ChatMessage {
    /// Time used for ordering. Unparseable timestamps sort first.
    pub fn effective_time(&self) -> DateTime<Utc> {
        parse_timestamp(&self.timestamp).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Parse an ISO-8601 timestamp, accepting zone-less values as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Body published to a room destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub room_id: RoomId,
    pub content: String,
    pub sender: String,
    pub sender_role: SenderRole,
    pub client_id: String,
    pub timestamp: String,
}

// --- Pagination ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub page: PageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub number: u32,
    pub size: u32,
    pub has_next: bool,
}

/// A page of room history. Page 0 holds the newest messages.
pub type RoomPage = PagedResponse<ChatMessage>;

pub type RoomListPage = PagedResponse<ChatRoom>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_accepts_numbers_and_strings() {
        let from_num: RoomId = serde_json::from_str("42").unwrap();
        let from_str: RoomId = serde_json::from_str("\" 42 \"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"42\"");
    }

    #[test]
    fn sender_role_spellings() {
        assert_eq!(SenderRole::parse("OWNER"), Some(SenderRole::Owner));
        assert_eq!(SenderRole::parse("customer"), Some(SenderRole::User));
        assert_eq!(SenderRole::parse("admin"), None);
    }

    #[test]
    fn unparseable_timestamp_sorts_at_epoch() {
        let msg = ChatMessage {
            id: "1".into(),
            room_id: RoomId::from("r"),
            content: "hi".into(),
            sender_id: "u1".into(),
            sender_display: None,
            sender_role: SenderRole::User,
            timestamp: "yesterday-ish".into(),
            is_optimistic: false,
            client_id: None,
        };
        assert_eq!(msg.effective_time(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn zoneless_timestamp_is_utc() {
        let parsed = parse_timestamp("2024-05-01T10:00:00.250").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_714_557_600_250);
    }
}
