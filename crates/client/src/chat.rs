//! View-model for one open chat room.

use std::sync::Arc;

use storetalk_shared::{ApiError, ChatMessage, ChatRoom, RoomId};
use thiserror::Error;

use crate::api_client::{RoomDirectory, DEFAULT_PAGE_SIZE};
use crate::stores::{ChatCache, Participant, QueryKey, RoomMessages};
use crate::ws::{RoomEvents, SessionError, TransportSession};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ChatError {
    /// Text fit for showing to the person chatting
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Api(e) => e.user_message(),
            ChatError::Session(e) => e.to_string(),
        }
    }
}

/// A room the local participant is chatting in.
///
/// Owns the room's event stream and message log; shares the session and
/// cache with every other open room.
pub struct RoomChat {
    session: TransportSession,
    directory: Arc<dyn RoomDirectory>,
    cache: ChatCache,
    participant: Participant,
    room: ChatRoom,
    events: RoomEvents,
    store: RoomMessages,
}

impl RoomChat {
    /// Run the REST connect handshake, subscribe, connect the session and
    /// load the newest history page.
    pub async fn open(
        session: TransportSession,
        directory: Arc<dyn RoomDirectory>,
        cache: ChatCache,
        room_id: RoomId,
        participant: Participant,
    ) -> Result<Self, ChatError> {
        let room = directory.connect_room(&room_id).await?;
        let events = session.subscribe(room_id.clone());

        if let Err(e) = session.connect().await {
            session.unsubscribe(&room_id);
            return Err(e.into());
        }

        let page = match cache.fetch_room_messages(directory.as_ref(), &room_id).await {
            Ok(page) => page,
            Err(e) => {
                session.unsubscribe(&room_id);
                return Err(e.into());
            }
        };
        let mut store = RoomMessages::new(room_id.clone());
        store.set_history(page);

        crate::log_info!(
            "opened room {} with {} ({} message(s) loaded)",
            room_id,
            room.counterpart_name,
            store.messages().len()
        );

        let mut chat = Self {
            session,
            directory,
            cache,
            participant,
            room,
            events,
            store,
        };
        chat.mark_read().await;
        Ok(chat)
    }

    pub fn room(&self) -> &ChatRoom {
        &self.room
    }

    pub fn room_id(&self) -> &RoomId {
        self.store.room_id()
    }

    /// Merged, ordered view of the room
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store.messages()
    }

    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Send with an optimistic local entry; rolled back if the session
    /// refuses the message. Blank text is refused up front with
    /// [`SessionError::EmptyMessage`].
    pub fn send(&mut self, content: &str) -> Result<ChatMessage, ChatError> {
        let content = content.trim();
        Ok(self
            .store
            .append_optimistic(content, &self.participant, &self.session)?)
    }

    /// Merge every already-received message. Returns how many were new.
    pub fn drain(&mut self) -> usize {
        let mut merged = 0;
        while let Some(message) = self.events.try_recv() {
            if self.store.on_confirmed_message(message) {
                merged += 1;
            }
        }
        merged
    }

    /// Wait for the next inbound message and merge it.
    ///
    /// Returns `None` once the room's stream has ended.
    pub async fn next_event(&mut self) -> Option<ChatMessage> {
        let message = self.events.recv().await?;
        self.store.on_confirmed_message(message.clone());
        Some(message)
    }

    /// Fetch the next older history page. Returns the number of messages
    /// on that page, or 0 when the beginning was already reached.
    pub async fn load_older(&mut self) -> Result<usize, ChatError> {
        if !self.store.has_more_history() {
            return Ok(0);
        }
        let page = self
            .directory
            .room_messages(self.store.room_id(), self.store.next_page(), DEFAULT_PAGE_SIZE)
            .await?;
        let count = page.items.len();
        self.store.prepend_history(page);
        Ok(count)
    }

    /// Reload the newest page when inbound traffic marked it stale. Older
    /// pages already loaded are kept.
    pub async fn refresh_history(&mut self) -> Result<bool, ChatError> {
        let key = QueryKey::RoomMessages(self.store.room_id().clone());
        if !self.cache.is_stale(&key) {
            return Ok(false);
        }
        let page = self
            .cache
            .fetch_room_messages(self.directory.as_ref(), self.store.room_id())
            .await?;
        self.store.merge_newest(page);
        Ok(true)
    }

    /// Reset unread counts locally and on the server. Failures are logged.
    pub async fn mark_read(&mut self) {
        self.cache.mark_read(self.store.room_id());
        self.room.unread_count = 0;
        if let Err(e) = self.directory.mark_read(self.store.room_id()).await {
            crate::log_warn!("failed to mark room {} read: {}", self.store.room_id(), e);
        }
    }

    /// Leave the room. The session stays up for other rooms.
    pub fn close(self) {
        self.session.unsubscribe(self.store.room_id());
    }
}
