// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Session persistence and the per-session message queue. See spec §3
//! "Store", "Queue" and §4.5.
//!
//! [`Store`] is the read/catalog side (what [`crate::manager::SessionManager`]
//! uses to enumerate sessions at startup and to reconstruct history on
//! resume); [`crate::recorder::Recorder`] is the write side for a single
//! live session. A [`Queue`] is scoped to one session id and holds
//! messages submitted while that session is busy prompting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub workspace_dir: String,
    pub agent_session_id: Option<String>,
    pub title: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub message: String,
    pub image_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
}

/// Catalog and event-log persistence for all sessions. Implementations
/// are responsible for their own on-disk layout; this crate's Non-goals
/// exclude prescribing one (spec §1).
#[async_trait]
pub trait Store: Send + Sync {
    async fn create(&self, metadata: SessionMetadata) -> anyhow::Result<()>;
    async fn get_metadata(&self, id: &str) -> anyhow::Result<Option<SessionMetadata>>;
    async fn update_metadata(&self, metadata: SessionMetadata) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<SessionMetadata>>;

    async fn read_events(&self, id: &str) -> anyhow::Result<Vec<Event>>;
    async fn read_events_from(&self, id: &str, from_seq: i64) -> anyhow::Result<Vec<Event>>;

    async fn get_image_path(&self, id: &str, image_id: &str) -> anyhow::Result<Option<String>>;

    /// Deletes sessions' persisted state older than the caller's retention
    /// policy. Returns the ids removed.
    async fn cleanup_retention(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<String>>;
}

/// A FIFO queue of messages submitted to one session while it is busy.
/// See spec §4.5 for dispatch semantics; this trait covers storage only.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn add(&self, message: String, image_ids: Vec<String>) -> anyhow::Result<QueuedMessage>;
    async fn pop(&self) -> anyhow::Result<Option<QueuedMessage>>;
    async fn len(&self) -> anyhow::Result<usize>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<QueuedMessage>>;
    async fn remove(&self, id: &str) -> anyhow::Result<bool>;
    async fn update_title(&self, id: &str, title: Option<String>) -> anyhow::Result<bool>;
}

/// An in-memory [`Store`] + per-session [`Queue`] factory for tests.
#[derive(Default)]
pub struct MemoryStore {
    sessions: tokio::sync::RwLock<std::collections::HashMap<String, SessionMetadata>>,
    events: tokio::sync::RwLock<std::collections::HashMap<String, Vec<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append_events(&self, id: &str, new_events: &[Event]) {
        let mut guard = self.events.write().await;
        guard.entry(id.to_string()).or_default().extend_from_slice(new_events);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, metadata: SessionMetadata) -> anyhow::Result<()> {
        self.sessions.write().await.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> anyhow::Result<Option<SessionMetadata>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update_metadata(&self, metadata: SessionMetadata) -> anyhow::Result<()> {
        self.sessions.write().await.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<SessionMetadata>> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn read_events(&self, id: &str) -> anyhow::Result<Vec<Event>> {
        Ok(self.events.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn read_events_from(&self, id: &str, from_seq: i64) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(id)
            .map(|evs| evs.iter().filter(|e| e.seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_image_path(&self, _id: &str, _image_id: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn cleanup_retention(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let mut sessions = self.sessions.write().await;
        let mut events = self.events.write().await;
        let stale: Vec<String> = sessions
            .values()
            .filter(|m| m.updated_at < older_than && !m.pinned)
            .map(|m| m.id.clone())
            .collect();
        for id in &stale {
            sessions.remove(id);
            events.remove(id);
        }
        Ok(stale)
    }
}

/// An in-memory [`Queue`] for tests, one instance per session.
#[derive(Default)]
pub struct MemoryQueue {
    messages: tokio::sync::RwLock<Vec<QueuedMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn add(&self, message: String, image_ids: Vec<String>) -> anyhow::Result<QueuedMessage> {
        let msg = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            image_ids,
            created_at: Utc::now(),
            title: None,
        };
        self.messages.write().await.push(msg.clone());
        Ok(msg)
    }

    async fn pop(&self) -> anyhow::Result<Option<QueuedMessage>> {
        let mut guard = self.messages.write().await;
        if guard.is_empty() {
            Ok(None)
        } else {
            Ok(Some(guard.remove(0)))
        }
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.messages.read().await.len())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<QueuedMessage>> {
        Ok(self.messages.read().await.iter().find(|m| m.id == id).cloned())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let mut guard = self.messages.write().await;
        let before = guard.len();
        guard.retain(|m| m.id != id);
        Ok(guard.len() != before)
    }

    async fn update_title(&self, id: &str, title: Option<String>) -> anyhow::Result<bool> {
        let mut guard = self.messages.write().await;
        if let Some(m) = guard.iter_mut().find(|m| m.id == id) {
            m.title = title;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
