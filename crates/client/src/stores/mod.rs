//! Client-side state: per-room message logs and the shared query cache.

pub mod messages;
pub mod rooms;

pub use messages::{MessageSink, Participant, RoomMessages};
pub use rooms::{ChatCache, QueryKey};
