//! Transport session: one broker connection shared by every room view.
//!
//! The application builds exactly one [`TransportSession`] at startup and
//! hands clones of it to each consumer. All clones share the same socket,
//! subscription registry and connection state.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_channel::mpsc::{unbounded, UnboundedSender};
use storetalk_shared::{room_destination, ChatMessage, Frame, OutboundMessage, RoomId};
use tokio::sync::{mpsc, oneshot};

use super::connection::{ConnectionState, SessionError};
use super::registry::SubscriptionRegistry;
use crate::config::ChatConfig;
use crate::normalize::normalize;
use crate::stores::{ChatCache, MessageSink};

pub(crate) type RoomSink = mpsc::UnboundedSender<ChatMessage>;

type Waiter = oneshot::Sender<Result<(), SessionError>>;

/// Handle to the shared broker connection
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ChatConfig,
    cache: Option<ChatCache>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    /// Bumped whenever a socket task is started or abandoned; events from a
    /// task holding an older generation are ignored.
    generation: u64,
    registry: SubscriptionRegistry<RoomSink>,
    outbound: Option<UnboundedSender<Frame>>,
    shutdown: Option<oneshot::Sender<()>>,
    waiters: Vec<Waiter>,
}

impl Shared {
    fn push(&self, frame: Frame) -> bool {
        match &self.outbound {
            Some(tx) => tx.unbounded_send(frame).is_ok(),
            None => false,
        }
    }

    fn resolve_waiters(&mut self, outcome: Result<(), SessionError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Per-room stream of normalized inbound messages.
///
/// Ends when the room is unsubscribed, re-subscribed elsewhere, or the
/// session disconnects.
#[derive(Debug)]
pub struct RoomEvents {
    room_id: RoomId,
    rx: mpsc::UnboundedReceiver<ChatMessage>,
}

impl RoomEvents {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<ChatMessage> {
        self.rx.try_recv().ok()
    }
}

impl TransportSession {
    pub fn new(config: ChatConfig) -> Self {
        Self::build(config, None)
    }

    /// Session that patches `cache` with every inbound message
    pub fn with_cache(config: ChatConfig, cache: ChatCache) -> Self {
        Self::build(config, Some(cache))
    }

    fn build(config: ChatConfig, cache: Option<ChatCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    registry: SubscriptionRegistry::new(),
                    outbound: None,
                    shutdown: None,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state.is_connected()
    }

    pub fn is_subscribed(&self, room: &RoomId) -> bool {
        self.lock().registry.contains(room)
    }

    /// Rooms currently registered, in registration order
    pub fn subscribed_rooms(&self) -> Vec<RoomId> {
        self.lock().registry.rooms()
    }

    /// Connect to the broker.
    ///
    /// Resolves immediately when already connected. While a connect or
    /// reconnect is in flight the caller joins it instead of opening a second
    /// socket. Fails with [`SessionError::ConnectionTimeout`] or
    /// [`SessionError::Connection`]; this layer never retries a failed
    /// initial connect.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let ready = {
            let mut shared = self.lock();
            if shared.state.is_connected() {
                return Ok(());
            }
            if shared.state.is_connecting() {
                let (tx, rx) = oneshot::channel();
                shared.waiters.push(tx);
                rx
            } else {
                shared.generation += 1;
                let generation = shared.generation;

                let (out_tx, out_rx) = unbounded();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let (tx, rx) = oneshot::channel();

                shared.outbound = Some(out_tx);
                shared.shutdown = Some(shutdown_tx);
                shared.waiters.push(tx);
                shared.state = ConnectionState::Connecting;

                crate::log_info!(
                    "connecting to {} (generation {})",
                    self.inner.config.broker_url,
                    generation
                );
                tokio::spawn(super::driver::run(
                    self.clone(),
                    generation,
                    out_rx,
                    shutdown_rx,
                ));
                rx
            }
        };

        ready.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Tear down every subscription and the socket.
    ///
    /// Takes effect immediately: the state is `Disconnected` when this
    /// returns and pending `connect()` callers fail with
    /// [`SessionError::Closed`].
    pub fn disconnect(&self) {
        let mut shared = self.lock();
        let connected = shared.state.is_connected();

        let frames = shared.registry.unsubscribe_all(connected);
        if connected {
            for frame in frames {
                shared.push(frame);
            }
            shared.push(Frame::disconnect(&format!(
                "disconnect-{}",
                shared.generation
            )));
        }

        shared.outbound = None;
        if let Some(shutdown) = shared.shutdown.take() {
            let _ = shutdown.send(());
        }
        shared.resolve_waiters(Err(SessionError::Closed));
        shared.state = ConnectionState::Disconnected;
        shared.generation += 1;

        crate::log_info!("session disconnected");
    }

    /// Subscribe to a room's topic and return its event stream.
    ///
    /// Subscribing to a room that is already registered swaps in the new
    /// stream (the previous one ends) without another broker subscription.
    /// Before the session is connected the subscription is held and sent on
    /// connect.
    pub fn subscribe(&self, room: impl Into<RoomId>) -> RoomEvents {
        let room_id = room.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut shared = self.lock();
        let connected = shared.state.is_connected();
        if let Some(frame) = shared.registry.subscribe(room_id.clone(), tx, connected) {
            crate::log_debug!("subscribing to room {}", room_id);
            shared.push(frame);
        }

        RoomEvents { room_id, rx }
    }

    /// Release a room's subscription. No-op for unknown rooms.
    pub fn unsubscribe(&self, room: &RoomId) {
        let mut shared = self.lock();
        let connected = shared.state.is_connected();
        if let Some(frame) = shared.registry.unsubscribe(room, connected) {
            crate::log_debug!("unsubscribing from room {}", room);
            shared.push(frame);
        }
    }

    /// Publish a message to a room. Fails with [`SessionError::NotConnected`]
    /// unless connected; never waits.
    pub fn send_message(&self, room: &RoomId, message: &OutboundMessage) -> Result<(), SessionError> {
        if message.content.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let body =
            serde_json::to_string(message).map_err(|e| SessionError::Encode(e.to_string()))?;

        let shared = self.lock();
        if !shared.state.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if shared.push(Frame::send(&room_destination(room), body)) {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    // --- driver callbacks ---

    /// Handshake done: mark connected and return the subscriptions to replay.
    /// `None` when the driver belongs to an abandoned generation.
    pub(crate) fn on_connected(&self, generation: u64) -> Option<Vec<Frame>> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return None;
        }
        let frames = shared.registry.replay();
        shared.state = ConnectionState::Connected;
        shared.resolve_waiters(Ok(()));
        crate::log_info!(
            "connected to {}, replaying {} subscription(s)",
            self.inner.config.broker_url,
            frames.len()
        );
        Some(frames)
    }

    /// Established connection dropped; the driver is about to retry.
    pub(crate) fn on_reconnecting(&self, generation: u64, attempt: u32) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation {
            return false;
        }
        shared.registry.detach();
        shared.state = ConnectionState::Reconnecting { attempt };
        true
    }

    /// The driver gave up. Subscriptions stay registered for the next connect.
    pub(crate) fn on_failed(&self, generation: u64, error: SessionError) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        crate::log_error!("connection to {} failed: {}", self.inner.config.broker_url, error);
        shared.registry.detach();
        shared.outbound = None;
        shared.shutdown = None;
        shared.state = ConnectionState::Disconnected;
        shared.resolve_waiters(Err(error));
    }

    /// Route an inbound `MESSAGE` frame to its room stream and the cache.
    pub(crate) fn dispatch(&self, generation: u64, frame: &Frame) {
        let (room_id, sink) = {
            let shared = self.lock();
            if shared.generation != generation {
                return;
            }
            match shared
                .registry
                .route(frame.get("subscription"), frame.get("destination"))
            {
                Some(entry) => (entry.room_id.clone(), entry.sink.clone()),
                None => {
                    crate::log_debug!(
                        "no subscription for message on {:?}",
                        frame.get("destination")
                    );
                    return;
                }
            }
        };

        for message in normalize(&frame.body, &room_id) {
            if let Some(cache) = &self.inner.cache {
                cache.on_inbound(&message);
            }
            if sink.send(message).is_err() {
                crate::log_debug!("room {} stream dropped; message not delivered", room_id);
            }
        }
    }
}

impl MessageSink for TransportSession {
    fn send_message(&self, room: &RoomId, message: &OutboundMessage) -> Result<(), SessionError> {
        TransportSession::send_message(self, room, message)
    }
}
