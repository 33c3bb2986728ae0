//! Per-owner broadcast of event frames.
//!
//! Each subscriber gets its own bounded channel. Broadcasting never blocks:
//! a subscriber whose buffer is full misses that frame, the others still
//! receive it. Owners with no subscribers have no slot, so nothing is
//! retained for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::{EventFrame, NoteEvent, OwnerId};

type Registry = HashMap<OwnerId, HashMap<u64, mpsc::Sender<EventFrame>>>;

struct Inner {
    subscribers: Mutex<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates are single map operations; a panic mid-update
        // cannot leave it inconsistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owner-scoped event fan-out
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `buffer` frames each
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a subscriber; its first frame is the keep-alive
    pub fn subscribe(&self, owner: OwnerId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        // Fresh channel with capacity >= 1, so this cannot fail
        let _ = tx.try_send(EventFrame::KeepAlive);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .registry()
            .entry(owner)
            .or_default()
            .insert(id, tx);
        debug!(owner, subscriber = id, "Subscriber registered");

        Subscription {
            owner,
            id,
            receiver: rx,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Send a named event to every live subscriber of `owner`.
    ///
    /// Returns how many subscribers accepted the frame.
    pub fn broadcast(&self, owner: OwnerId, name: &str, payload: &str) -> usize {
        let mut registry = self.inner.registry();
        let Some(subscribers) = registry.get_mut(&owner) else {
            return 0;
        };

        let frame = EventFrame::event(name, payload);
        let mut delivered = 0;
        subscribers.retain(|id, sender| match sender.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(owner, subscriber = *id, event = name, "Subscriber buffer full; frame dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            registry.remove(&owner);
        }
        delivered
    }

    /// Broadcast a note lifecycle event
    pub fn publish(&self, owner: OwnerId, event: NoteEvent, payload: &str) -> usize {
        self.broadcast(owner, event.name(), payload)
    }

    /// Number of live subscribers for `owner`
    pub fn subscriber_count(&self, owner: OwnerId) -> usize {
        self.inner
            .registry()
            .get(&owner)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Number of owners with at least one subscriber
    pub fn owner_count(&self) -> usize {
        self.inner.registry().len()
    }
}

/// A live event stream for one owner; dropping it unsubscribes
pub struct Subscription {
    owner: OwnerId,
    id: u64,
    receiver: mpsc::Receiver<EventFrame>,
    bus: Arc<Inner>,
}

impl Subscription {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Wait for the next frame
    pub async fn recv(&mut self) -> Option<EventFrame> {
        self.receiver.recv().await
    }

    /// Next frame if one is already buffered
    pub fn try_recv(&mut self) -> Option<EventFrame> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.bus.registry();
        if let Some(subscribers) = registry.get_mut(&self.owner) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                registry.remove(&self.owner);
            }
        }
        debug!(owner = self.owner, subscriber = self.id, "Subscriber removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_is_keepalive() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(1);
        assert_eq!(sub.try_recv(), Some(EventFrame::KeepAlive));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_broadcast_is_owner_scoped() {
        let bus = EventBus::new(4);
        let mut mine = bus.subscribe(1);
        let mut theirs = bus.subscribe(2);
        mine.try_recv();
        theirs.try_recv();

        assert_eq!(bus.broadcast(1, "note-created", "5"), 1);
        assert_eq!(mine.try_recv(), Some(EventFrame::event("note-created", "5")));
        assert_eq!(theirs.try_recv(), None);
    }

    #[test]
    fn test_drop_removes_owner_slot() {
        let bus = EventBus::new(4);
        let first = bus.subscribe(1);
        let second = bus.subscribe(1);
        assert_eq!(bus.subscriber_count(1), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(1), 1);
        drop(second);
        assert_eq!(bus.owner_count(), 0);
    }

    #[test]
    fn test_full_buffer_drops_only_for_that_subscriber() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe(1);
        let mut fast = bus.subscribe(1);
        fast.try_recv();

        // `slow` still holds its keep-alive, so its buffer is full
        assert_eq!(bus.broadcast(1, "note-status", "a"), 1);
        assert_eq!(fast.try_recv(), Some(EventFrame::event("note-status", "a")));
        assert_eq!(slow.try_recv(), Some(EventFrame::KeepAlive));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(bus.subscriber_count(1), 2);
    }
}
