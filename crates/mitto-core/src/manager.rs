// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Session Manager: the bounded registry of Background Sessions. See
//! spec §3 "Session Manager state" and §4.7.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broadcaster::GlobalBroadcaster;
use crate::connection::{AgentCallbacks, AgentConnection};
use crate::error::{SessionError, SessionResult};
use crate::event::PlanEntry;
use crate::hooks::HookManager;
use crate::queue;
use crate::recorder::Recorder;
use crate::session::{BackgroundSession, SessionConfig, SessionParams};
use crate::store::Queue;

/// Everything the manager needs to actually stand up a session: spawning
/// the connection and wiring persistence is left to the caller since
/// neither the agent binary nor the storage backend are this crate's
/// concern (spec §1 Non-goals).
pub trait SessionFactory: Send + Sync {
    fn build_connection(&self, workspace: &str, callbacks: Arc<dyn AgentCallbacks>) -> Arc<dyn AgentConnection>;
    fn build_recorder(&self, persisted_id: &str) -> Option<Arc<dyn Recorder>>;
    fn build_queue(&self, persisted_id: &str) -> Option<Arc<dyn Queue>>;
    fn hooks(&self) -> Arc<dyn HookManager>;
}

/// Where a [`BackgroundSession`] mirrors its most recently seen plan so the
/// manager's `plan_cache_get` has something to return before the next plan
/// event arrives (spec §4.7).
pub trait PlanCacheSink: Send + Sync {
    fn record(&self, persisted_id: &str, entries: Vec<PlanEntry>);
    fn clear(&self, persisted_id: &str);
}

/// Forwards into a [`SessionManager`] without the session holding a strong
/// reference back to it, mirroring [`crate::session::BackgroundSession`]'s
/// own `Weak`-back-reference idiom.
struct ManagerPlanCacheSink(Weak<SessionManager>);

impl PlanCacheSink for ManagerPlanCacheSink {
    fn record(&self, persisted_id: &str, entries: Vec<PlanEntry>) {
        if let Some(mgr) = self.0.upgrade() {
            mgr.plan_cache_set(persisted_id, entries);
        }
    }
    fn clear(&self, persisted_id: &str) {
        if let Some(mgr) = self.0.upgrade() {
            mgr.plan_cache_clear(persisted_id);
        }
    }
}

struct ManagerState {
    sessions: HashMap<String, Arc<BackgroundSession>>,
}

/// Bounded registry of live Background Sessions, keyed by persisted id.
/// `MaxSessions` (default 32, see `mitto_config::Config::max_sessions`)
/// is enforced with a fast-path check under the read lock and a
/// double-check under the write lock before insertion (spec §5).
pub struct SessionManager {
    state: RwLock<ManagerState>,
    max_sessions: usize,
    factory: Arc<dyn SessionFactory>,
    broadcaster: Arc<GlobalBroadcaster>,
    plan_cache: std::sync::Mutex<HashMap<String, Vec<PlanEntry>>>,
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    /// Built via `Arc::new_cyclic` so sessions it creates can hold a
    /// [`Weak`] handle back to it (for [`PlanCacheSink`]) without forming a
    /// reference cycle.
    pub fn new(max_sessions: usize, factory: Arc<dyn SessionFactory>, broadcaster: Arc<GlobalBroadcaster>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: RwLock::new(ManagerState {
                sessions: HashMap::new(),
            }),
            max_sessions,
            factory,
            broadcaster,
            plan_cache: std::sync::Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    fn plan_cache_sink(&self) -> Arc<dyn PlanCacheSink> {
        Arc::new(ManagerPlanCacheSink(self.self_ref.clone()))
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn active_session_count(&self) -> usize {
        let guard = self.state.read().await;
        let mut n = 0;
        for s in guard.sessions.values() {
            if !s.is_closed() {
                n += 1;
            }
        }
        n
    }

    pub async fn prompting_session_count(&self) -> usize {
        let guard = self.state.read().await;
        let mut n = 0;
        for s in guard.sessions.values() {
            if s.is_prompting().await {
                n += 1;
            }
        }
        n
    }

    pub async fn list_running_sessions(&self) -> Vec<Arc<BackgroundSession>> {
        self.state.read().await.sessions.values().cloned().collect()
    }

    pub async fn get_session(&self, persisted_id: &str) -> Option<Arc<BackgroundSession>> {
        self.state.read().await.sessions.get(persisted_id).cloned()
    }

    pub async fn remove_session(&self, persisted_id: &str) -> Option<Arc<BackgroundSession>> {
        self.state.write().await.sessions.remove(persisted_id)
    }

    /// Creates a brand-new session. Capacity is checked both before the
    /// (relatively expensive) session construction and again, under the
    /// write lock, immediately before insertion, so a race between two
    /// concurrent creates at the capacity boundary cannot overcommit
    /// (spec §5).
    pub async fn create_session(&self, persisted_id: String, workspace_id: uuid::Uuid, working_dir: String, config: SessionConfig) -> SessionResult<Arc<BackgroundSession>> {
        {
            let guard = self.state.read().await;
            if guard.sessions.len() >= self.max_sessions {
                return Err(SessionError::Capacity(self.max_sessions));
            }
            if guard.sessions.contains_key(&persisted_id) {
                return Err(SessionError::AlreadyExists(persisted_id));
            }
        }

        let recorder = self.factory.build_recorder(&persisted_id);
        let queue = self.factory.build_queue(&persisted_id);
        let hooks = self.factory.hooks();
        let params = SessionParams {
            persisted_id: persisted_id.clone(),
            workspace_id,
            working_dir: working_dir.clone(),
            recorder,
            queue,
            hooks,
            processors: Vec::new(),
            config,
            is_resumed: false,
            history: Vec::new(),
            plan_cache: Some(self.plan_cache_sink()),
        };
        let factory = self.factory.clone();
        let working_dir_for_conn = working_dir.clone();
        let session = BackgroundSession::new(params, move |callbacks| factory.build_connection(&working_dir_for_conn, callbacks));

        if let Err(e) = session.connect(None).await {
            self.broadcaster.broadcast(crate::broadcaster::event_type::ACP_START_FAILED, persisted_id.as_str());
            return Err(e);
        }
        self.broadcaster.broadcast(crate::broadcaster::event_type::ACP_STARTED, persisted_id.as_str());

        {
            let mut guard = self.state.write().await;
            if guard.sessions.len() >= self.max_sessions {
                session.close("capacity_rollback").await;
                return Err(SessionError::Capacity(self.max_sessions));
            }
            if guard.sessions.contains_key(&persisted_id) {
                session.close("duplicate_rollback").await;
                return Err(SessionError::AlreadyExists(persisted_id));
            }
            guard.sessions.insert(persisted_id.clone(), session.clone());
        }

        self.plan_cache.lock().unwrap().remove(&persisted_id);
        info!(session_id = %persisted_id, "session created");
        self.broadcaster.broadcast(crate::broadcaster::event_type::SESSION_CREATED, persisted_id.as_str());
        Ok(session)
    }

    /// Resumes a session. If it is already live in the registry, returns
    /// it directly; otherwise the caller's factory must be able to
    /// reconstruct a connection from the metadata it has already read
    /// (the agent session id and server name are authoritative from
    /// storage, not the current workspace default — spec §4.7).
    pub async fn resume_session(
        &self,
        persisted_id: String,
        workspace_id: uuid::Uuid,
        working_dir: String,
        prior_agent_session_id: Option<String>,
        history: Vec<(String, String)>,
        config: SessionConfig,
    ) -> SessionResult<Arc<BackgroundSession>> {
        if let Some(existing) = self.get_session(&persisted_id).await {
            return Ok(existing);
        }

        {
            let guard = self.state.read().await;
            if guard.sessions.len() >= self.max_sessions {
                return Err(SessionError::Capacity(self.max_sessions));
            }
        }

        let recorder = self.factory.build_recorder(&persisted_id);
        let queue = self.factory.build_queue(&persisted_id);
        let hooks = self.factory.hooks();
        let params = SessionParams {
            persisted_id: persisted_id.clone(),
            workspace_id,
            working_dir: working_dir.clone(),
            recorder,
            queue,
            hooks,
            processors: Vec::new(),
            config,
            is_resumed: true,
            history,
            plan_cache: Some(self.plan_cache_sink()),
        };
        let factory = self.factory.clone();
        let working_dir_for_conn = working_dir.clone();
        let session = BackgroundSession::new(params, move |callbacks| factory.build_connection(&working_dir_for_conn, callbacks));

        if let Err(e) = session.connect(prior_agent_session_id.as_deref()).await {
            self.broadcaster.broadcast(crate::broadcaster::event_type::ACP_START_FAILED, persisted_id.as_str());
            return Err(e);
        }
        self.broadcaster.broadcast(crate::broadcaster::event_type::ACP_STARTED, persisted_id.as_str());

        {
            let mut guard = self.state.write().await;
            if guard.sessions.len() >= self.max_sessions {
                session.close("capacity_rollback").await;
                return Err(SessionError::Capacity(self.max_sessions));
            }
            guard.sessions.insert(persisted_id.clone(), session.clone());
        }

        info!(session_id = %persisted_id, "session resumed");
        Ok(session)
    }

    pub async fn close_session(&self, persisted_id: &str, reason: &str) {
        if let Some(session) = self.remove_session(persisted_id).await {
            session.close(reason).await;
            self.plan_cache.lock().unwrap().remove(persisted_id);
            self.broadcaster.broadcast(crate::broadcaster::event_type::ACP_STOPPED, persisted_id);
            self.broadcaster.broadcast(crate::broadcaster::event_type::SESSION_DELETED, persisted_id);
        }
    }

    /// Waits up to `timeout` for the session to stop prompting before
    /// closing it. If the timeout elapses first, closes anyway — `Close`
    /// always wins eventually, it is simply not abrupt when it doesn't
    /// have to be.
    pub async fn close_session_gracefully(&self, persisted_id: &str, reason: &str, timeout: Duration) {
        if let Some(session) = self.get_session(persisted_id).await {
            let deadline = tokio::time::Instant::now() + timeout;
            while session.is_prompting().await && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if session.is_prompting().await {
                warn!(session_id = %persisted_id, "graceful close timed out while still prompting");
            }
        }
        self.close_session(persisted_id, reason).await;
    }

    pub async fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.state.read().await.sessions.keys().cloned().collect();
        for id in ids {
            self.close_session(&id, reason).await;
        }
    }

    /// Startup recovery: resumes every session the caller reports as
    /// active-with-pending-queue, and kicks its try-process without
    /// blocking startup (spec §4.7).
    pub async fn process_pending_queues(self: &Arc<Self>, pending: Vec<(String, uuid::Uuid, String, Option<String>, SessionConfig)>) {
        for (persisted_id, workspace_id, working_dir, prior_agent_session_id, config) in pending {
            match self
                .resume_session(persisted_id.clone(), workspace_id, working_dir, prior_agent_session_id, Vec::new(), config)
                .await
            {
                Ok(session) => {
                    tokio::spawn(async move {
                        queue::try_process(&session).await;
                    });
                }
                Err(e) => {
                    warn!(session_id = %persisted_id, error = %e, "failed to resume session during startup queue recovery");
                }
            }
        }
    }

    pub fn plan_cache_get(&self, persisted_id: &str) -> Option<Vec<PlanEntry>> {
        self.plan_cache.lock().unwrap().get(persisted_id).cloned()
    }

    pub fn plan_cache_set(&self, persisted_id: &str, entries: Vec<PlanEntry>) {
        self.plan_cache.lock().unwrap().insert(persisted_id.to_string(), entries);
    }

    pub fn plan_cache_clear(&self, persisted_id: &str) {
        self.plan_cache.lock().unwrap().remove(persisted_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockConnection;
    use crate::hooks::NoopHookManager;
    use crate::recorder::MemoryRecorder;
    use crate::store::MemoryQueue;

    struct TestFactory;

    impl SessionFactory for TestFactory {
        fn build_connection(&self, _workspace: &str, callbacks: Arc<dyn AgentCallbacks>) -> Arc<dyn AgentConnection> {
            Arc::new(MockConnection::new(callbacks, Vec::new()))
        }
        fn build_recorder(&self, persisted_id: &str) -> Option<Arc<dyn Recorder>> {
            Some(Arc::new(MemoryRecorder::new(persisted_id)))
        }
        fn build_queue(&self, _persisted_id: &str) -> Option<Arc<dyn Queue>> {
            Some(Arc::new(MemoryQueue::new()) as Arc<dyn Queue>)
        }
        fn hooks(&self) -> Arc<dyn HookManager> {
            Arc::new(NoopHookManager)
        }
    }

    fn manager(max_sessions: usize) -> Arc<SessionManager> {
        SessionManager::new(max_sessions, Arc::new(TestFactory), Arc::new(GlobalBroadcaster::new(8)))
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_recovers_after_close() {
        let mgr = manager(2);
        let ws = uuid::Uuid::new_v4();
        mgr.create_session("a".into(), ws, "/w".into(), SessionConfig::default()).await.unwrap();
        mgr.create_session("b".into(), ws, "/w".into(), SessionConfig::default()).await.unwrap();

        let result = mgr.create_session("c".into(), ws, "/w".into(), SessionConfig::default()).await;
        assert!(matches!(result, Err(SessionError::Capacity(2))));

        mgr.close_session("a", "user_closed").await;
        let result = mgr.create_session("c".into(), ws, "/w".into(), SessionConfig::default()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn duplicate_persisted_id_rejected() {
        let mgr = manager(4);
        let ws = uuid::Uuid::new_v4();
        mgr.create_session("dup".into(), ws, "/w".into(), SessionConfig::default()).await.unwrap();
        let result = mgr.create_session("dup".into(), ws, "/w".into(), SessionConfig::default()).await;
        assert!(matches!(result, Err(SessionError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn plan_cache_round_trips_and_clears() {
        let mgr = manager(4);
        mgr.plan_cache_set("s1", vec![PlanEntry { content: "step 1".into(), status: crate::event::ToolCallStatus::Pending }]);
        assert!(mgr.plan_cache_get("s1").is_some());
        mgr.plan_cache_clear("s1");
        assert!(mgr.plan_cache_get("s1").is_none());
    }

    #[tokio::test]
    async fn resume_returns_existing_live_session() {
        let mgr = manager(4);
        let ws = uuid::Uuid::new_v4();
        let created = mgr.create_session("r1".into(), ws, "/w".into(), SessionConfig::default()).await.unwrap();
        let resumed = mgr.resume_session("r1".into(), ws, "/w".into(), None, Vec::new(), SessionConfig::default()).await.unwrap();
        assert!(Arc::ptr_eq(&created, &resumed));
    }

    struct ScriptedFactory {
        turns: std::sync::Mutex<Vec<Vec<crate::connection::mock::ScriptedEvent>>>,
    }

    impl SessionFactory for ScriptedFactory {
        fn build_connection(&self, _workspace: &str, callbacks: Arc<dyn AgentCallbacks>) -> Arc<dyn AgentConnection> {
            let turns = std::mem::take(&mut *self.turns.lock().unwrap());
            Arc::new(MockConnection::new(callbacks, turns))
        }
        fn build_recorder(&self, persisted_id: &str) -> Option<Arc<dyn Recorder>> {
            Some(Arc::new(MemoryRecorder::new(persisted_id)))
        }
        fn build_queue(&self, _persisted_id: &str) -> Option<Arc<dyn Queue>> {
            Some(Arc::new(MemoryQueue::new()) as Arc<dyn Queue>)
        }
        fn hooks(&self) -> Arc<dyn HookManager> {
            Arc::new(NoopHookManager)
        }
    }

    #[tokio::test]
    async fn plan_cache_is_populated_from_live_plan_events_and_cleared_on_next_prompt() {
        let turn = vec![crate::connection::mock::ScriptedEvent::Plan(Some(vec![PlanEntry {
            content: "step 1".into(),
            status: crate::event::ToolCallStatus::Running,
        }]))];
        let factory = Arc::new(ScriptedFactory {
            turns: std::sync::Mutex::new(vec![turn, Vec::new()]),
        });
        let mgr = SessionManager::new(4, factory, Arc::new(GlobalBroadcaster::new(8)));
        let ws = uuid::Uuid::new_v4();
        let session = mgr.create_session("p1".into(), ws, "/w".into(), SessionConfig::default()).await.unwrap();
        assert!(mgr.plan_cache_get("p1").is_none());

        session.prompt("hi".into(), vec![], crate::observer::PromptMeta::default()).await.unwrap();
        for _ in 0..50 {
            if !session.is_prompting().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mgr.plan_cache_get("p1").unwrap()[0].content, "step 1");

        // Clearing on prompt acceptance happens synchronously, before the
        // prompt's own (empty) scripted turn runs.
        session.prompt("second".into(), vec![], crate::observer::PromptMeta::default()).await.unwrap();
        assert!(mgr.plan_cache_get("p1").is_none());
    }
}
