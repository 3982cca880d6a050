//! Converts broker payloads into canonical [`ChatMessage`]s.
//!
//! Brokers and history endpoints disagree on field names, so every field is
//! looked up under each of its known aliases. Frames that cannot produce a
//! message are logged and dropped; nothing here returns an error.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use storetalk_shared::{ChatMessage, RoomId, SenderRole};

const CONTENT_KEYS: &[&str] = &["message", "content"];
const SENDER_KEYS: &[&str] = &["sender", "senderId"];
const DISPLAY_KEYS: &[&str] = &["senderName", "senderNickname", "senderDisplay"];
const ROLE_KEYS: &[&str] = &["senderRole", "senderType"];
const TIME_KEYS: &[&str] = &["timestamp", "createdAt"];
const ID_KEYS: &[&str] = &["id", "messageId"];
const ROOM_KEYS: &[&str] = &["roomId", "chatRoomId"];
const CLIENT_ID_KEYS: &[&str] = &["clientId", "nonce"];

static GENERATED_IDS: AtomicU64 = AtomicU64::new(0);

/// Normalize a raw frame body received on `room`.
///
/// A JSON array is a batch and every element is normalized. Non-JSON bodies
/// and elements missing a sender or content yield nothing.
pub fn normalize(body: &str, room: &RoomId) -> Vec<ChatMessage> {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            crate::log_debug!("dropping non-JSON frame on room {}: {}", room, e);
            return Vec::new();
        }
    };

    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| normalize_value(item, room))
            .collect(),
        other => normalize_value(&other, room).into_iter().collect(),
    }
}

/// Normalize one decoded JSON object.
pub fn normalize_value(value: &Value, room: &RoomId) -> Option<ChatMessage> {
    let Some(obj) = value.as_object() else {
        crate::log_debug!("dropping non-object payload on room {}", room);
        return None;
    };

    let content = lookup_text(obj, CONTENT_KEYS);
    let sender_id = lookup_text(obj, SENDER_KEYS);
    let (Some(content), Some(sender_id)) = (content, sender_id) else {
        crate::log_debug!("dropping payload without sender or content on room {}", room);
        return None;
    };

    let now = Utc::now();
    let timestamp = lookup_timestamp(obj).unwrap_or_else(|| format_time(now));
    let id = lookup_text(obj, ID_KEYS).unwrap_or_else(|| generated_id(now));
    if let Some(claimed) = lookup_text(obj, ROOM_KEYS).map(RoomId::new) {
        if &claimed != room {
            crate::log_debug!("dropping payload for room {} received on room {}", claimed, room);
            return None;
        }
    }
    let sender_role = lookup_text(obj, ROLE_KEYS)
        .and_then(|r| SenderRole::parse(&r))
        .unwrap_or_default();

    Some(ChatMessage {
        id,
        room_id: room.clone(),
        content,
        sender_id,
        sender_display: lookup_text(obj, DISPLAY_KEYS),
        sender_role,
        timestamp,
        is_optimistic: false,
        client_id: lookup_text(obj, CLIENT_ID_KEYS),
    })
}

/// First non-empty alias, as text. Numbers are stringified.
fn lookup_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Timestamps arrive as ISO strings or epoch milliseconds.
fn lookup_timestamp(obj: &Map<String, Value>) -> Option<String> {
    TIME_KEYS.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(format_time),
        _ => None,
    })
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Millisecond-clock id for payloads that carry none. The sequence suffix
/// keeps ids distinct when several arrive within one millisecond.
fn generated_id(now: DateTime<Utc>) -> String {
    let seq = GENERATED_IDS.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", now.timestamp_millis(), seq)
}
