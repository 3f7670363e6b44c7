// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Global Broadcaster: process-wide lifecycle event fan-out, independent
//! of any one session's [`crate::observer::ObserverSet`]. See spec §4.8.
//!
//! Subscribers get a bounded channel each; a lagging or closed subscriber
//! never blocks a broadcast, mirroring the same never-block contract the
//! per-session observer fan-out gives (spec §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

/// A fan-out lifecycle notification. `event_type` is one of the
/// well-known constants below; `payload` is a caller-defined JSON blob
/// (session id, rename text, queue length, whatever the event needs).
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Well-known lifecycle event type names (spec §4.8).
pub mod event_type {
    pub const SESSION_CREATED: &str = "session_created";
    pub const SESSION_RENAMED: &str = "session_renamed";
    pub const SESSION_PINNED: &str = "session_pinned";
    pub const SESSION_ARCHIVED: &str = "session_archived";
    pub const SESSION_DELETED: &str = "session_deleted";
    pub const SESSION_STREAMING: &str = "session_streaming";
    pub const ACP_STARTED: &str = "acp_started";
    pub const ACP_STOPPED: &str = "acp_stopped";
    pub const ACP_START_FAILED: &str = "acp_start_failed";
    pub const PERIODIC_UPDATED: &str = "periodic_updated";
    pub const PERIODIC_STARTED: &str = "periodic_started";
    pub const PROMPTS_CHANGED: &str = "prompts_changed";
    pub const QUEUE_MESSAGE_SENDING: &str = "queue_message_sending";
    pub const QUEUE_MESSAGE_SENT: &str = "queue_message_sent";
    pub const QUEUE_UPDATED: &str = "queue_updated";
    pub const HOOK_FAILED: &str = "hook_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    handle: SubscriptionHandle,
    tx: mpsc::Sender<BroadcastEvent>,
}

/// Process-wide pub/sub hub for lifecycle events. Unlike a session's
/// [`crate::observer::ObserverSet`], broadcaster subscribers are not
/// scoped to a single session and receive events from every session the
/// process manages.
pub struct GlobalBroadcaster {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl GlobalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes and returns the handle plus the receiving end of a
    /// bounded channel sized `capacity`.
    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::Receiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().expect("broadcaster lock poisoned").push(Subscriber { handle, tx });
        (handle, rx)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers
            .write()
            .expect("broadcaster lock poisoned")
            .retain(|s| s.handle != handle);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("broadcaster lock poisoned").len()
    }

    /// Fans `event_type`/`payload` out to every subscriber. Never blocks:
    /// a full or closed subscriber channel just drops the event for that
    /// subscriber (spec §4.8 "never blocks a session's own event loop").
    pub fn broadcast(&self, event_type: &str, payload: impl Into<Value>) {
        let event = BroadcastEvent {
            event_type: event_type.to_string(),
            payload: payload.into(),
        };
        let guard = self.subscribers.read().expect("broadcaster lock poisoned");
        for sub in guard.iter() {
            if sub.tx.try_send(event.clone()).is_err() {
                trace!(event_type, "broadcast dropped for a lagging or closed subscriber");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let bus = GlobalBroadcaster::new(8);
        let (_handle, mut rx) = bus.subscribe();
        bus.broadcast(event_type::SESSION_CREATED, "s1");
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, event_type::SESSION_CREATED);
        assert_eq!(received.payload, Value::String("s1".to_string()));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = GlobalBroadcaster::new(8);
        let (handle, mut rx) = bus.subscribe();
        bus.unsubscribe(handle);
        bus.broadcast(event_type::SESSION_DELETED, "s1");
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let bus = GlobalBroadcaster::new(1);
        let (_handle, _rx) = bus.subscribe();
        bus.broadcast(event_type::QUEUE_UPDATED, "one");
        bus.broadcast(event_type::QUEUE_UPDATED, "two");
    }
}
