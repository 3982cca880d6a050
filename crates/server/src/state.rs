//! Application state shared across request handlers and broker sockets.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use storetalk_shared::{ChatMessage, ChatRoom, OutboundMessage, PageInfo, PagedResponse, RoomId};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::config::ServerConfig;

const TOPIC_CAPACITY: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    rooms: Arc<RwLock<BTreeMap<RoomId, ChatRoom>>>,
    history: Arc<RwLock<HashMap<RoomId, Vec<ChatMessage>>>>,
    topics: Arc<RwLock<HashMap<RoomId, broadcast::Sender<ChatMessage>>>>,
    subscribers: Arc<RwLock<HashMap<RoomId, usize>>>,
    connections: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::default(),
            history: Arc::default(),
            topics: Arc::default(),
            subscribers: Arc::default(),
            connections: Arc::default(),
            kick: broadcast::channel(1).0,
        }
    }

    // --- rooms ---

    /// Look up a room, creating it on first inquiry
    pub async fn ensure_room(&self, id: &RoomId) -> ChatRoom {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!("Creating room {}", id);
                ChatRoom {
                    id: id.clone(),
                    counterpart_name: format!("Room {}", id),
                    store_name: None,
                    last_message: None,
                    last_message_time: None,
                    unread_count: 0,
                }
            })
            .clone()
    }

    pub async fn insert_room(&self, room: ChatRoom) {
        self.rooms.write().await.insert(room.id.clone(), room);
    }

    pub async fn room(&self, id: &RoomId) -> Option<ChatRoom> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Rooms ordered by most recent message, then id
    pub async fn list_rooms(&self, page: u32, size: u32) -> PagedResponse<ChatRoom> {
        let mut rooms: Vec<ChatRoom> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        paginate(rooms, page, size)
    }

    pub async fn mark_read(&self, id: &RoomId) -> bool {
        match self.rooms.write().await.get_mut(id) {
            Some(room) => {
                room.unread_count = 0;
                true
            }
            None => false,
        }
    }

    // --- messages ---

    /// History page; page 0 holds the newest messages, oldest first within
    /// the page.
    pub async fn history_page(&self, id: &RoomId, page: u32, size: u32) -> PagedResponse<ChatMessage> {
        let newest_first: Vec<ChatMessage> = self
            .history
            .read()
            .await
            .get(id)
            .map(|messages| messages.iter().rev().cloned().collect())
            .unwrap_or_default();
        let mut response = paginate(newest_first, page, size);
        response.items.reverse();
        response
    }

    /// Store a message sent to a room and fan it out to subscribers.
    pub async fn publish(&self, id: &RoomId, outbound: OutboundMessage) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: id.clone(),
            content: outbound.content,
            sender_id: outbound.sender,
            sender_display: None,
            sender_role: outbound.sender_role,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            is_optimistic: false,
            client_id: Some(outbound.client_id).filter(|c| !c.is_empty()),
        };

        self.ensure_room(id).await;
        if let Some(room) = self.rooms.write().await.get_mut(id) {
            room.last_message = Some(message.content.clone());
            room.last_message_time = Some(message.timestamp.clone());
            room.unread_count = room.unread_count.saturating_add(1);
        }
        self.history
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .push(message.clone());

        let delivered = self.topic(id).await.send(message.clone()).unwrap_or(0);
        tracing::debug!("Published {} to room {} ({} receivers)", message.id, id, delivered);
        message
    }

    /// Get or create the broadcast channel for a room
    pub async fn topic(&self, id: &RoomId) -> broadcast::Sender<ChatMessage> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(id) {
                return sender.clone();
            }
        }

        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(id) {
            return sender.clone();
        }

        let (tx, _rx) = broadcast::channel(TOPIC_CAPACITY);
        topics.insert(id.clone(), tx.clone());
        tx
    }

    // --- broker bookkeeping ---

    pub async fn track_subscribe(&self, id: &RoomId) {
        *self.subscribers.write().await.entry(id.clone()).or_default() += 1;
    }

    pub async fn track_unsubscribe(&self, id: &RoomId) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(count) = subscribers.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                subscribers.remove(id);
            }
        }
    }

    /// Live broker subscriptions to a room across all sockets
    pub async fn subscriber_count(&self, id: &RoomId) -> usize {
        self.subscribers.read().await.get(id).copied().unwrap_or(0)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// STOMP sessions accepted since startup
    pub fn connections_opened(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn kicked(&self) -> broadcast::Receiver<()> {
        self.kick.subscribe()
    }

    /// Drop every broker socket without a STOMP goodbye
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }
}

fn paginate<T>(items: Vec<T>, page: u32, size: u32) -> PagedResponse<T> {
    let size = size.max(1);
    let start = (page as usize).saturating_mul(size as usize);
    let total = items.len();
    let items: Vec<T> = items.into_iter().skip(start).take(size as usize).collect();
    PagedResponse {
        items,
        page: PageInfo {
            number: page,
            size,
            has_next: start.saturating_add(size as usize) < total,
        },
    }
}

#[cfg(test)]
mod tests {
    use storetalk_shared::SenderRole;

    use super::*;

    fn outbound(content: &str) -> OutboundMessage {
        OutboundMessage {
            room_id: RoomId::from("1"),
            content: content.to_string(),
            sender: "u1".to_string(),
            sender_role: SenderRole::User,
            client_id: "c-1".to_string(),
            timestamp: String::new(),
        }
    }

    #[tokio::test]
    async fn history_pages_run_newest_first() {
        let state = AppState::new(ServerConfig::local());
        let room = RoomId::from("1");
        for n in 0..5 {
            state.publish(&room, outbound(&format!("m{}", n))).await;
        }

        let first = state.history_page(&room, 0, 2).await;
        let contents: Vec<_> = first.items.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(first.page.has_next);

        let last = state.history_page(&room, 2, 2).await;
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].content, "m0");
        assert!(!last.page.has_next);
    }

    #[tokio::test]
    async fn publish_updates_room_summary() {
        let state = AppState::new(ServerConfig::local());
        let room = RoomId::from("1");
        let message = state.publish(&room, outbound("hello")).await;
        assert_eq!(message.client_id.as_deref(), Some("c-1"));

        let summary = state.room(&room).await.unwrap();
        assert_eq!(summary.last_message.as_deref(), Some("hello"));
        assert_eq!(summary.unread_count, 1);

        assert!(state.mark_read(&room).await);
        assert_eq!(state.room(&room).await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn rooms_list_most_recent_first() {
        let state = AppState::new(ServerConfig::local());
        for (id, time) in [("1", "2024-05-01T10:00:00.000Z"), ("2", "2024-05-02T10:00:00.000Z")] {
            state
                .insert_room(ChatRoom {
                    id: RoomId::from(id),
                    counterpart_name: format!("Shop {}", id),
                    store_name: None,
                    last_message: Some("hi".to_string()),
                    last_message_time: Some(time.to_string()),
                    unread_count: 0,
                })
                .await;
        }
        state.ensure_room(&RoomId::from("3")).await;

        let listed = state.list_rooms(0, 10).await;
        let ids: Vec<_> = listed.items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "3"]);
        assert!(!listed.page.has_next);
    }

    #[tokio::test]
    async fn subscriber_counts_never_go_negative() {
        let state = AppState::new(ServerConfig::local());
        let room = RoomId::from("1");
        state.track_unsubscribe(&room).await;
        state.track_subscribe(&room).await;
        assert_eq!(state.subscriber_count(&room).await, 1);
        state.track_unsubscribe(&room).await;
        state.track_unsubscribe(&room).await;
        assert_eq!(state.subscriber_count(&room).await, 0);
    }
}
