//! Shared query cache for the room list and room history pages.
//!
//! Inbound messages patch the cached room list in place and mark the room's
//! history stale, so other views stay current without a refetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use storetalk_shared::{ApiError, ChatMessage, ChatRoom, RoomId, RoomPage};

use crate::api_client::{RoomDirectory, DEFAULT_PAGE_SIZE};

/// Cache keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Rooms,
    RoomMessages(RoomId),
}

#[derive(Debug, Clone)]
struct Entry<T> {
    data: T,
    stale: bool,
}

impl<T> Entry<T> {
    fn fresh(data: T) -> Self {
        Self {
            data,
            stale: false,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    rooms: Option<Entry<Vec<ChatRoom>>>,
    messages: HashMap<RoomId, Entry<RoomPage>>,
}

/// Cloneable handle to the shared cache.
#[derive(Debug, Clone, Default)]
pub struct ChatCache {
    state: Arc<Mutex<CacheState>>,
}

impl ChatCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply an inbound message.
    ///
    /// Marks the room's history stale and patches the room's list entry with
    /// the message text and time, bumping its unread count. Other rooms are
    /// left alone. Rooms missing from the cached list are not added.
    pub fn on_inbound(&self, message: &ChatMessage) {
        let mut state = self.lock();

        if let Some(entry) = state.messages.get_mut(&message.room_id) {
            entry.stale = true;
        }

        if let Some(entry) = state.rooms.as_mut() {
            if let Some(room) = entry.data.iter_mut().find(|r| r.id == message.room_id) {
                room.last_message = Some(message.content.clone());
                room.last_message_time = Some(message.timestamp.clone());
                room.unread_count = room.unread_count.saturating_add(1);
            }
        }
    }

    pub fn rooms(&self) -> Option<Vec<ChatRoom>> {
        self.lock().rooms.as_ref().map(|e| e.data.clone())
    }

    pub fn room(&self, id: &RoomId) -> Option<ChatRoom> {
        self.lock()
            .rooms
            .as_ref()
            .and_then(|e| e.data.iter().find(|r| &r.id == id).cloned())
    }

    pub fn set_rooms(&self, rooms: Vec<ChatRoom>) {
        self.lock().rooms = Some(Entry::fresh(rooms));
    }

    pub fn room_messages(&self, room: &RoomId) -> Option<RoomPage> {
        self.lock().messages.get(room).map(|e| e.data.clone())
    }

    pub fn set_room_messages(&self, room: RoomId, page: RoomPage) {
        self.lock().messages.insert(room, Entry::fresh(page));
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        let state = self.lock();
        match key {
            QueryKey::Rooms => state.rooms.as_ref().map(|e| e.stale).unwrap_or(true),
            QueryKey::RoomMessages(room) => {
                state.messages.get(room).map(|e| e.stale).unwrap_or(true)
            }
        }
    }

    pub fn invalidate(&self, key: &QueryKey) {
        let mut state = self.lock();
        match key {
            QueryKey::Rooms => {
                if let Some(entry) = state.rooms.as_mut() {
                    entry.stale = true;
                }
            }
            QueryKey::RoomMessages(room) => {
                if let Some(entry) = state.messages.get_mut(room) {
                    entry.stale = true;
                }
            }
        }
    }

    /// Reset a room's unread count locally.
    pub fn mark_read(&self, room: &RoomId) {
        let mut state = self.lock();
        if let Some(entry) = state.rooms.as_mut() {
            if let Some(cached) = entry.data.iter_mut().find(|r| &r.id == room) {
                cached.unread_count = 0;
            }
        }
    }

    /// Room list, refetched from `directory` only when missing or stale.
    pub async fn fetch_rooms(&self, directory: &dyn RoomDirectory) -> Result<Vec<ChatRoom>, ApiError> {
        if !self.is_stale(&QueryKey::Rooms) {
            if let Some(rooms) = self.rooms() {
                return Ok(rooms);
            }
        }
        let page = directory.list_rooms(0, DEFAULT_PAGE_SIZE).await?;
        crate::log_debug!("fetched {} room(s)", page.items.len());
        self.set_rooms(page.items.clone());
        Ok(page.items)
    }

    /// Newest history page for a room, refetched only when missing or stale.
    pub async fn fetch_room_messages(
        &self,
        directory: &dyn RoomDirectory,
        room: &RoomId,
    ) -> Result<RoomPage, ApiError> {
        let key = QueryKey::RoomMessages(room.clone());
        if !self.is_stale(&key) {
            if let Some(page) = self.room_messages(room) {
                return Ok(page);
            }
        }
        let page = directory.room_messages(room, 0, DEFAULT_PAGE_SIZE).await?;
        self.set_room_messages(room.clone(), page.clone());
        Ok(page)
    }
}
