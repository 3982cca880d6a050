//! STOMP-over-WebSocket transport shared by every room view.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐ ┌───────────┐ ┌───────────┐
//! │ RoomChat  │ │ RoomChat  │ │ RoomList  │
//! │ (room A)  │ │ (room B)  │ │  (cache)  │
//! └───────────┘ └───────────┘ └───────────┘
//!       │             │             │
//!       └─────────────┼─────────────┘
//!                     ▼
//!        ┌──────────────────────────┐
//!        │     TransportSession     │
//!        │ state + registry (mutex) │
//!        └──────────────────────────┘
//!                     │ outbound frames
//!                     ▼
//!        ┌──────────────────────────┐
//!        │   driver task (tokio)    │
//!        │ handshake, pump, retry   │
//!        └──────────────────────────┘
//!                     │
//!                     ▼
//!                STOMP broker
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = TransportSession::new(ChatConfig::from_env());
//! let mut events = session.subscribe("42");
//! session.connect().await?;
//! while let Some(message) = events.recv().await {
//!     println!("{}: {}", message.sender_id, message.content);
//! }
//! ```

mod connection;
mod driver;
mod registry;
mod session;

pub use connection::{ConnectionState, ReconnectConfig, SessionError};
pub use session::{RoomEvents, TransportSession};
