//! Storetalk client - real-time chat synchronization
//!
//! This crate keeps customer/owner chat rooms in sync with a STOMP broker:
//! one shared transport session, per-room subscriptions, payload
//! normalization, optimistic sends and a shared room/history cache.

pub mod api_client;
pub mod chat;
pub mod config;
pub mod logging;
pub mod normalize;
pub mod storage;
pub mod stores;
pub mod ws;

pub use api_client::{ApiClient, RoomDirectory};
pub use chat::{ChatError, RoomChat};
pub use config::ChatConfig;
pub use storage::Storage;
pub use stores::{ChatCache, MessageSink, Participant, QueryKey, RoomMessages};
pub use ws::{ConnectionState, RoomEvents, SessionError, TransportSession};
