// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Observer Set and fan-out. See spec §4.2.
//!
//! An [`Observer`] is an abstract sink for one session's streaming events.
//! The [`ObserverSet`] holds zero or more of them with unique membership
//! (tracked by an opaque [`ObserverHandle`] minted on `add`, since trait
//! objects have no natural identity to compare) and fans events out under
//! a reader lock so concurrent callbacks never block each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventData, PlanEntry, ToolCallStatus};

/// Metadata accompanying a user prompt, forwarded to `OnUserPrompt`.
#[derive(Debug, Clone, Default)]
pub struct PromptMeta {
    pub sender: Option<String>,
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub label: String,
    /// Whether selecting this option counts as "permissive" for the
    /// purposes of auto-approval (spec §4.6 "select the first permissive
    /// option").
    pub permissive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tool_title: String,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub option_id: Option<String>,
    pub cancelled: bool,
}

/// An observer errored while answering a synchronous callback (currently
/// only possible for `on_permission`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("observer error: {0}")]
pub struct ObserverError(pub String);

/// A sink for one session's streaming events and lifecycle notifications.
///
/// Implementors must not block indefinitely: the [`ObserverSet`] invokes
/// these under a read lock, and a slow implementation stalls every other
/// observer's delivery for that event. The expected pattern (spec §5) is
/// to enqueue onto the observer's own bounded channel and drop on
/// overflow; see [`ChannelObserver`] for a ready-made implementation of
/// that pattern.
pub trait Observer: Send + Sync {
    fn on_agent_message(&self, seq: i64, html: &str, coalesced: bool) {
        let _ = (seq, html, coalesced);
    }
    fn on_agent_thought(&self, seq: i64, text: &str, coalesced: bool) {
        let _ = (seq, text, coalesced);
    }
    fn on_tool_call(&self, seq: i64, id: &str, title: &str, status: &ToolCallStatus) {
        let _ = (seq, id, title, status);
    }
    fn on_tool_call_update(&self, seq: i64, id: &str, status: Option<&ToolCallStatus>) {
        let _ = (seq, id, status);
    }
    fn on_plan(&self, seq: i64, entries: Option<&[PlanEntry]>) {
        let _ = (seq, entries);
    }
    fn on_file_read(&self, seq: i64, path: &str, size: u64) {
        let _ = (seq, path, size);
    }
    fn on_file_write(&self, seq: i64, path: &str, size: u64) {
        let _ = (seq, path, size);
    }
    fn on_user_prompt(&self, message: &str, meta: &PromptMeta) {
        let _ = (message, meta);
    }
    fn on_prompt_complete(&self, event_count: usize) {
        let _ = event_count;
    }
    fn on_error(&self, message: &str) {
        let _ = message;
    }
    /// Synchronous rendezvous: the agent's thread is blocked on this
    /// return value. See spec §4.6.
    fn on_permission(&self, request: &PermissionRequest) -> Result<PermissionResponse, ObserverError> {
        let _ = request;
        Ok(PermissionResponse {
            option_id: None,
            cancelled: true,
        })
    }
    fn on_queue_message_sending(&self, id: &str) {
        let _ = id;
    }
    fn on_queue_message_sent(&self, id: &str) {
        let _ = id;
    }
    fn on_queue_updated(&self, len: usize, action: &str, id: &str) {
        let _ = (len, action, id);
    }
}

/// Dispatch one buffered [`Event`] to an observer's per-type method. Used
/// both for live fan-out and late-join replay so the two paths can never
/// drift apart.
pub fn dispatch_event(observer: &dyn Observer, ev: &Event, coalesced: bool) {
    match &ev.data {
        EventData::AgentMessage { html } => observer.on_agent_message(ev.seq, html, coalesced),
        EventData::AgentThought { text } => observer.on_agent_thought(ev.seq, text, coalesced),
        EventData::ToolCall { id, title, status } => {
            observer.on_tool_call(ev.seq, id, title, status)
        }
        EventData::ToolCallUpdate { id, status } => {
            observer.on_tool_call_update(ev.seq, id, status.as_ref())
        }
        EventData::Plan { entries } => observer.on_plan(ev.seq, entries.as_deref()),
        EventData::FileRead { path, size } => observer.on_file_read(ev.seq, path, *size),
        EventData::FileWrite { path, size } => observer.on_file_write(ev.seq, path, *size),
    }
}

/// Opaque membership token returned by [`ObserverSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

#[derive(Default)]
pub struct ObserverSet {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverHandle, Arc<dyn Observer>)>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. If `replay` is `Some(events)` (the session is
    /// currently prompting — spec §4.2/§4.4.1), the full current buffer is
    /// dispatched to this observer, in order, before returning — so it can
    /// never race with a live event delivered after registration.
    pub fn add(&self, observer: Arc<dyn Observer>, replay: Option<&[Event]>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut guard = self.observers.write().expect("observer set lock poisoned");
            guard.push((handle, observer.clone()));
        }
        if let Some(events) = replay {
            for ev in events {
                // Replayed events are, by construction, already coalesced
                // into their final form.
                dispatch_event(observer.as_ref(), ev, false);
            }
        }
        handle
    }

    pub fn remove(&self, handle: ObserverHandle) {
        let mut guard = self.observers.write().expect("observer set lock poisoned");
        guard.retain(|(h, _)| *h != handle);
    }

    pub fn count(&self) -> usize {
        self.observers.read().expect("observer set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Snapshot of currently attached observers, for callers (permission
    /// handling, queue notifications) that need to pick one or iterate
    /// outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers
            .read()
            .expect("observer set lock poisoned")
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Call `f` for every currently attached observer, under a read lock.
    /// `f` must not block indefinitely (see the [`Observer`] trait docs).
    pub fn notify_all(&self, f: impl Fn(&dyn Observer)) {
        let guard = self.observers.read().expect("observer set lock poisoned");
        for (_, o) in guard.iter() {
            f(o.as_ref());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
