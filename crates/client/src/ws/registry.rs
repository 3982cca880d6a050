//! Per-room subscription bookkeeping.
//!
//! The registry never touches a socket. Each mutation returns the STOMP
//! frame that should go on the wire, if any, and the session writes it.
//! Entries keep registration order so a reconnect replays rooms in the order
//! they were first subscribed.

use storetalk_shared::{room_from_destination, room_topic, Frame, RoomId};

#[derive(Debug)]
pub(crate) struct Subscription<S> {
    pub room_id: RoomId,
    /// Broker-level subscription id; `None` while pending
    pub handle: Option<String>,
    pub sink: S,
}

#[derive(Debug)]
pub(crate) struct SubscriptionRegistry<S> {
    entries: Vec<Subscription<S>>,
    next_id: u64,
}

impl<S> Default for SubscriptionRegistry<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<S> SubscriptionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&mut self) -> String {
        self.next_id += 1;
        format!("sub-{}", self.next_id)
    }

    fn position(&self, room: &RoomId) -> Option<usize> {
        self.entries.iter().position(|e| &e.room_id == room)
    }

    /// Register interest in a room.
    ///
    /// An existing room only has its sink replaced. A new room gets a
    /// `SUBSCRIBE` frame when `connected`, otherwise it waits for [`replay`].
    ///
    /// [`replay`]: SubscriptionRegistry::replay
    pub fn subscribe(&mut self, room: RoomId, sink: S, connected: bool) -> Option<Frame> {
        if let Some(idx) = self.position(&room) {
            self.entries[idx].sink = sink;
            return None;
        }

        let (handle, frame) = if connected {
            let handle = self.allocate_handle();
            let frame = Frame::subscribe(&handle, &room_topic(&room));
            (Some(handle), Some(frame))
        } else {
            (None, None)
        };

        self.entries.push(Subscription {
            room_id: room,
            handle,
            sink,
        });
        frame
    }

    /// Forget a room. No-op when the room is unknown.
    pub fn unsubscribe(&mut self, room: &RoomId, connected: bool) -> Option<Frame> {
        let idx = self.position(room)?;
        let entry = self.entries.remove(idx);
        match entry.handle {
            Some(handle) if connected => Some(Frame::unsubscribe(&handle)),
            _ => None,
        }
    }

    /// Forget every room, returning `UNSUBSCRIBE` frames for live subscriptions.
    pub fn unsubscribe_all(&mut self, connected: bool) -> Vec<Frame> {
        let frames = if connected {
            self.entries
                .iter()
                .filter_map(|e| e.handle.as_deref().map(Frame::unsubscribe))
                .collect()
        } else {
            Vec::new()
        };
        self.entries.clear();
        frames
    }

    /// Issue a fresh `SUBSCRIBE` for every room, in registration order.
    ///
    /// Called once per established socket; previous handles belong to a
    /// dead connection and are replaced.
    pub fn replay(&mut self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(self.entries.len());
        for idx in 0..self.entries.len() {
            let handle = self.allocate_handle();
            frames.push(Frame::subscribe(
                &handle,
                &room_topic(&self.entries[idx].room_id),
            ));
            self.entries[idx].handle = Some(handle);
        }
        frames
    }

    /// Mark every subscription pending after the socket went away.
    pub fn detach(&mut self) {
        for entry in &mut self.entries {
            entry.handle = None;
        }
    }

    /// Find the subscription an inbound `MESSAGE` belongs to.
    ///
    /// Matches the `subscription` header first and falls back to the
    /// destination topic.
    pub fn route(
        &self,
        subscription: Option<&str>,
        destination: Option<&str>,
    ) -> Option<&Subscription<S>> {
        if let Some(id) = subscription {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.handle.as_deref() == Some(id))
            {
                return Some(entry);
            }
        }
        let room = destination.and_then(room_from_destination)?;
        self.entries.iter().find(|e| e.room_id == room)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.entries.iter().map(|e| e.room_id.clone()).collect()
    }

    pub fn contains(&self, room: &RoomId) -> bool {
        self.position(room).is_some()
    }
}

#[cfg(test)]
impl<S> SubscriptionRegistry<S> {
    /// Whether the room has a broker-level subscription right now
    fn is_live(&self, room: &RoomId) -> bool {
        self.position(room)
            .map(|idx| self.entries[idx].handle.is_some())
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use storetalk_shared::Command;

    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::from(id)
    }

    #[test]
    fn pending_rooms_replay_once_each_in_order() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.subscribe(room("A"), 1, false).is_none());
        assert!(registry.subscribe(room("B"), 2, false).is_none());

        let frames = registry.replay();
        let destinations: Vec<_> = frames.iter().map(|f| f.get("destination")).collect();
        assert_eq!(
            destinations,
            vec![Some("/topic/room/A"), Some("/topic/room/B")]
        );
        assert!(frames.iter().all(|f| f.command == Command::Subscribe));
        assert!(registry.is_live(&room("A")));
        assert!(registry.is_live(&room("B")));
    }

    #[test]
    fn resubscribing_replaces_the_sink_without_wire_traffic() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.subscribe(room("A"), "first", true).is_some());
        assert!(registry.subscribe(room("A"), "second", true).is_none());
        assert_eq!(registry.len(), 1);

        let entry = registry.route(None, Some("/topic/room/A")).unwrap();
        assert_eq!(entry.sink, "second");
    }

    #[test]
    fn unsubscribe_releases_live_handles_only() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(room("A"), (), true);
        registry.subscribe(room("B"), (), false);

        let frame = registry.unsubscribe(&room("A"), true).unwrap();
        assert_eq!(frame.command, Command::Unsubscribe);
        assert_eq!(frame.get("id"), Some("sub-1"));

        assert!(registry.unsubscribe(&room("B"), true).is_none());
        assert!(registry.unsubscribe(&room("missing"), true).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn replay_after_detach_issues_fresh_handles() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(room("A"), (), true);
        registry.detach();
        assert!(!registry.is_live(&room("A")));

        let frames = registry.replay();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("id"), Some("sub-2"));
        assert!(registry.route(Some("sub-1"), None).is_none());
        assert!(registry.route(Some("sub-2"), None).is_some());
    }

    #[test]
    fn unsubscribe_all_clears_everything() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(room("A"), (), true);
        registry.subscribe(room("B"), (), true);
        let frames = registry.unsubscribe_all(true);
        assert_eq!(frames.len(), 2);
        assert!(registry.is_empty());
    }
}
