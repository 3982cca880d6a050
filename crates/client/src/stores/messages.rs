//! Per-room message log merging optimistic sends with confirmed messages.
//!
//! A room view owns one [`RoomMessages`]. Loaded history pages and local
//! entries (pending sends and messages confirmed since the page was loaded)
//! are kept apart and merged on read, deduplicated by id and ordered by
//! timestamp.

use chrono::{SecondsFormat, Utc};
use storetalk_shared::{ChatMessage, OutboundMessage, RoomId, RoomPage, SenderRole};
use uuid::Uuid;

use crate::ws::SessionError;

/// Confirmed messages with equal content from one sender closer together
/// than this are treated as the same message.
const DUPLICATE_WINDOW_MS: i64 = 1000;

/// Where optimistic sends go. Implemented by the transport session.
pub trait MessageSink {
    fn send_message(&self, room: &RoomId, message: &OutboundMessage) -> Result<(), SessionError>;
}

/// The local user as seen by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub display: Option<String>,
    pub role: SenderRole,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: SenderRole) -> Self {
        Self {
            id: id.into(),
            display: None,
            role,
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// Messages for a single room.
#[derive(Debug, Clone)]
pub struct RoomMessages {
    room_id: RoomId,
    /// Server history, oldest first
    history: Vec<ChatMessage>,
    /// Optimistic entries and messages confirmed after the last history load
    local: Vec<ChatMessage>,
    /// Whether the first history page has been applied
    pub is_loaded: bool,
    has_more: bool,
    next_page: u32,
}

impl RoomMessages {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            history: Vec::new(),
            local: Vec::new(),
            is_loaded: false,
            has_more: false,
            next_page: 0,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Append a pending message and publish it through `sink`.
    ///
    /// Blank content is refused before anything is recorded. The entry is
    /// removed again when the sink rejects it, and the error is returned.
    /// There is no retry.
    pub fn append_optimistic(
        &mut self,
        content: &str,
        sender: &Participant,
        sink: &impl MessageSink,
    ) -> Result<ChatMessage, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let now = Utc::now();
        let message = ChatMessage {
            id: self.temp_id(now.timestamp_millis()),
            room_id: self.room_id.clone(),
            content: content.to_string(),
            sender_id: sender.id.clone(),
            sender_display: sender.display.clone(),
            sender_role: sender.role,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            is_optimistic: true,
            client_id: Some(Uuid::new_v4().to_string()),
        };
        self.local.push(message.clone());

        let outbound = OutboundMessage {
            room_id: self.room_id.clone(),
            content: message.content.clone(),
            sender: message.sender_id.clone(),
            sender_role: message.sender_role,
            client_id: message.client_id.clone().unwrap_or_default(),
            timestamp: message.timestamp.clone(),
        };

        if let Err(e) = sink.send_message(&self.room_id, &outbound) {
            self.local.retain(|m| m.id != message.id);
            crate::log_warn!("send to room {} failed, rolled back: {}", self.room_id, e);
            return Err(e);
        }
        Ok(message)
    }

    /// `temp-<ms>`, suffixed when two sends land in the same millisecond
    fn temp_id(&self, millis: i64) -> String {
        let base = format!("temp-{}", millis);
        if !self.local.iter().any(|m| m.id == base) {
            return base;
        }
        (1..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.local.iter().any(|m| &m.id == candidate))
            .unwrap_or(base)
    }

    /// Merge a message confirmed by the broker.
    ///
    /// Returns `false` when it was recognised as a duplicate.
    pub fn on_confirmed_message(&mut self, mut message: ChatMessage) -> bool {
        self.remove_pending_echo(&message);

        if self.is_duplicate(&message) {
            crate::log_debug!("dropping duplicate message {} in room {}", message.id, self.room_id);
            return false;
        }

        message.is_optimistic = false;
        self.local.push(message);
        true
    }

    /// Drop the pending entry this message confirms: the one with the same
    /// correlation id, or else the first with equal content from the same
    /// side of the conversation.
    fn remove_pending_echo(&mut self, confirmed: &ChatMessage) {
        let by_client_id = confirmed.client_id.as_deref().and_then(|client_id| {
            self.local
                .iter()
                .position(|m| m.is_optimistic && m.client_id.as_deref() == Some(client_id))
        });
        let index = by_client_id.or_else(|| {
            self.local.iter().position(|m| {
                m.is_optimistic
                    && m.content == confirmed.content
                    && m.sender_role == confirmed.sender_role
            })
        });
        if let Some(index) = index {
            self.local.remove(index);
        }
    }

    fn is_duplicate(&self, incoming: &ChatMessage) -> bool {
        let at = incoming.effective_time();
        self.history
            .iter()
            .chain(self.local.iter())
            .filter(|m| !m.is_optimistic)
            .any(|m| {
                m.id == incoming.id
                    || (m.content == incoming.content
                        && m.sender_id == incoming.sender_id
                        && (m.effective_time() - at).num_milliseconds().abs() < DUPLICATE_WINDOW_MS)
            })
    }

    /// Replace history with the newest page.
    ///
    /// Confirmed local entries now covered by history are dropped; pending
    /// entries stay.
    pub fn set_history(&mut self, page: RoomPage) {
        let mut items = page.items;
        items.sort_by_key(|m| m.effective_time());
        self.local
            .retain(|m| m.is_optimistic || !items.iter().any(|h| h.id == m.id));
        self.history = items;
        self.has_more = page.page.has_next;
        self.next_page = page.page.number + 1;
        self.is_loaded = true;
    }

    /// Fold a refetched newest page into the loaded history.
    ///
    /// Older pages already loaded stay, and so does the paging cursor. Before
    /// the first load this is the same as [`RoomMessages::set_history`].
    pub fn merge_newest(&mut self, page: RoomPage) {
        if !self.is_loaded {
            self.set_history(page);
            return;
        }
        let fresh: Vec<ChatMessage> = page
            .items
            .into_iter()
            .filter(|m| !self.history.iter().any(|h| h.id == m.id))
            .collect();
        self.local
            .retain(|m| m.is_optimistic || !fresh.iter().any(|h| h.id == m.id));
        self.history.extend(fresh);
        self.history.sort_by_key(|m| m.effective_time());
    }

    /// Add an older page in front of the loaded history.
    pub fn prepend_history(&mut self, page: RoomPage) {
        let mut older: Vec<ChatMessage> = page
            .items
            .into_iter()
            .filter(|m| !self.history.iter().any(|h| h.id == m.id))
            .collect();
        older.sort_by_key(|m| m.effective_time());
        older.append(&mut self.history);
        self.history = older;
        self.has_more = page.page.has_next;
        self.next_page = page.page.number + 1;
    }

    /// Merged view: history then local, deduplicated by id, ascending by
    /// timestamp. Ties keep insertion order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(self.history.len() + self.local.len());
        for message in self.history.iter().chain(self.local.iter()) {
            if !merged.iter().any(|m| m.id == message.id) {
                merged.push(message.clone());
            }
        }
        merged.sort_by_key(|m| m.effective_time());
        merged
    }

    pub fn pending_count(&self) -> usize {
        self.local.iter().filter(|m| m.is_optimistic).count()
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more
    }

    /// Page number to request for older history
    pub fn next_page(&self) -> u32 {
        self.next_page
    }
}
