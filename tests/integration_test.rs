// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end round trips through the public API only: create a session
//! via the manager, prompt it, stream events through a channel observer,
//! resume it with history, and dispatch a queued message after
//! completion. Exercises the same scenarios the unit tests cover
//! in isolation, but wired together the way a real caller would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mitto_core::{
    AgentCallbacks, AgentConnection, ChannelObserver, ConnectError, GlobalBroadcaster, HookManager, MemoryQueue, MemoryRecorder, NoopHookManager, ObserverMessage, PlanEntry, PromptMeta, Queue, Recorder,
    SessionConfig, SessionError, SessionFactory, SessionManager, ToolCallStatus,
};

/// A scripted connection that replays a fixed turn on every `prompt`,
/// pausing `delay` between the tool-call and its completion so tests can
/// observe mid-stream state (busy rejection, late-join replay).
struct ScriptedConnection {
    callbacks: Arc<dyn AgentCallbacks>,
    delay: Duration,
}

#[async_trait]
impl AgentConnection for ScriptedConnection {
    async fn initialize(&self) -> Result<(), ConnectError> {
        Ok(())
    }

    async fn new_session(&self, _cwd: &str) -> Result<String, ConnectError> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn load_session(&self, _agent_session_id: &str, _cwd: &str) -> Result<(), ConnectError> {
        Ok(())
    }

    async fn prompt(&self, message: &str, _image_paths: &[String]) -> Result<(), ConnectError> {
        self.callbacks
            .on_plan(Some(vec![PlanEntry {
                content: "do the thing".to_string(),
                status: ToolCallStatus::Running,
            }]))
            .await;
        self.callbacks.on_tool_call("t1", "read", ToolCallStatus::Running).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.callbacks.on_tool_call_update("t1", Some(ToolCallStatus::Completed)).await;
        self.callbacks.on_agent_message(&format!("<p>{message}</p>")).await;
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ConnectError> {
        Ok(())
    }
}

/// Builds sessions against [`ScriptedConnection`]; optionally shares one
/// [`MemoryQueue`] across every session it builds so a test can push onto
/// the queue from outside the crate (`BackgroundSession::queue` is
/// crate-private by design).
struct TestFactory {
    delay: Duration,
    queue: Option<Arc<MemoryQueue>>,
}

impl TestFactory {
    fn new(delay: Duration) -> Self {
        Self { delay, queue: None }
    }

    fn with_queue(delay: Duration, queue: Arc<MemoryQueue>) -> Self {
        Self { delay, queue: Some(queue) }
    }
}

impl SessionFactory for TestFactory {
    fn build_connection(&self, _workspace: &str, callbacks: Arc<dyn AgentCallbacks>) -> Arc<dyn AgentConnection> {
        Arc::new(ScriptedConnection {
            callbacks,
            delay: self.delay,
        })
    }

    fn build_recorder(&self, persisted_id: &str) -> Option<Arc<dyn Recorder>> {
        Some(Arc::new(MemoryRecorder::new(persisted_id)))
    }

    fn build_queue(&self, _persisted_id: &str) -> Option<Arc<dyn Queue>> {
        match &self.queue {
            Some(q) => Some(q.clone() as Arc<dyn Queue>),
            None => Some(Arc::new(MemoryQueue::new()) as Arc<dyn Queue>),
        }
    }

    fn hooks(&self) -> Arc<dyn HookManager> {
        Arc::new(NoopHookManager)
    }
}

fn manager(max_sessions: usize, factory: TestFactory) -> Arc<SessionManager> {
    SessionManager::new(max_sessions, Arc::new(factory), Arc::new(GlobalBroadcaster::new(16)))
}

#[tokio::test]
async fn create_prompt_stream_complete_round_trip() {
    let mgr = manager(8, TestFactory::new(Duration::ZERO));
    let ws = uuid::Uuid::new_v4();
    let session = mgr.create_session("s1".to_string(), ws, "/workspace".to_string(), SessionConfig::default()).await.unwrap();

    let (observer, mut rx) = ChannelObserver::new("integration", 64);
    session.add_observer(Arc::new(observer)).await;
    session.prompt("hello".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();

    let mut kinds = Vec::new();
    while let Some(msg) = rx.recv().await {
        let done = matches!(msg, ObserverMessage::PromptComplete { .. });
        kinds.push(match &msg {
            ObserverMessage::Plan { .. } => "plan",
            ObserverMessage::ToolCall { .. } => "tool_call",
            ObserverMessage::ToolCallUpdate { .. } => "tool_call_update",
            ObserverMessage::AgentMessage { .. } => "agent_message",
            ObserverMessage::PromptComplete { .. } => "prompt_complete",
            _ => "other",
        });
        if done {
            break;
        }
    }

    assert_eq!(kinds, vec!["plan", "tool_call", "tool_call_update", "agent_message", "prompt_complete"]);
    assert_eq!(mgr.session_count().await, 1);
    assert_eq!(mgr.active_session_count().await, 1);
}

#[tokio::test]
async fn busy_rejects_concurrent_prompt_through_manager() {
    let mgr = manager(8, TestFactory::new(Duration::from_millis(50)));
    let ws = uuid::Uuid::new_v4();
    let session = mgr.create_session("s2".to_string(), ws, "/workspace".to_string(), SessionConfig::default()).await.unwrap();

    session.prompt("first".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();
    let second = session.prompt("second".to_string(), Vec::new(), PromptMeta::default()).await;
    assert!(matches!(second, Err(SessionError::Busy)));

    // Let the first turn finish so the session isn't dropped mid-flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!session.is_prompting().await);
}

#[tokio::test]
async fn late_join_observer_replays_buffer_then_streams_live() {
    let mgr = manager(8, TestFactory::new(Duration::from_millis(80)));
    let ws = uuid::Uuid::new_v4();
    let session = mgr.create_session("s3".to_string(), ws, "/workspace".to_string(), SessionConfig::default()).await.unwrap();

    session.prompt("hello".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();
    // The scripted connection has already delivered plan + tool_call and
    // is now asleep for 80ms before tool_call_update + agent_message.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (observer, mut rx) = ChannelObserver::new("late-joiner", 64);
    session.add_observer(Arc::new(observer)).await;

    let mut kinds = Vec::new();
    while let Some(msg) = rx.recv().await {
        let done = matches!(msg, ObserverMessage::PromptComplete { .. });
        kinds.push(match &msg {
            ObserverMessage::Plan { .. } => "plan",
            ObserverMessage::ToolCall { .. } => "tool_call",
            ObserverMessage::ToolCallUpdate { .. } => "tool_call_update",
            ObserverMessage::AgentMessage { .. } => "agent_message",
            ObserverMessage::PromptComplete { .. } => "prompt_complete",
            _ => "other",
        });
        if done {
            break;
        }
    }

    // Replay delivers the buffer accumulated before registration first,
    // then live delivery continues in order with no duplication or gaps.
    assert_eq!(kinds, vec!["plan", "tool_call", "tool_call_update", "agent_message", "prompt_complete"]);
}

#[tokio::test]
async fn resume_injects_history_preface_on_first_prompt() {
    let mgr = manager(8, TestFactory::new(Duration::ZERO));
    let ws = uuid::Uuid::new_v4();
    let working_dir = "/workspace".to_string();

    let session = mgr.create_session("s4".to_string(), ws, working_dir.clone(), SessionConfig::default()).await.unwrap();
    session.prompt("opening message".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    mgr.close_session("s4", "user_closed").await;
    assert!(mgr.get_session("s4").await.is_none());

    let history = vec![("user".to_string(), "what is the weather".to_string())];
    let resumed = mgr
        .resume_session("s4".to_string(), ws, working_dir, None, history, SessionConfig::default())
        .await
        .unwrap();

    let (observer, mut rx) = ChannelObserver::new("resumer", 64);
    resumed.add_observer(Arc::new(observer)).await;
    resumed.prompt("follow-up message".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();

    let mut agent_html = String::new();
    while let Some(msg) = rx.recv().await {
        if let ObserverMessage::AgentMessage { html, .. } = &msg {
            agent_html = html.clone();
        }
        if matches!(msg, ObserverMessage::PromptComplete { .. }) {
            break;
        }
    }

    assert!(agent_html.contains("Prior conversation summary"));
    assert!(agent_html.contains("what is the weather"));
    assert!(agent_html.contains("follow-up message"));
}

#[tokio::test]
async fn queued_message_dispatches_automatically_after_completion() {
    let queue = Arc::new(MemoryQueue::new());
    let mgr = manager(8, TestFactory::with_queue(Duration::ZERO, queue.clone()));
    let ws = uuid::Uuid::new_v4();
    let config = SessionConfig {
        queue_enabled: true,
        queue_delay_seconds: 0,
        ..SessionConfig::default()
    };
    let session = mgr.create_session("s5".to_string(), ws, "/workspace".to_string(), config).await.unwrap();

    let (observer, mut rx) = ChannelObserver::new("queue-watcher", 64);
    session.add_observer(Arc::new(observer)).await;

    queue.add("queued turn".to_string(), Vec::new()).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 1);

    session.prompt("live turn".to_string(), Vec::new(), PromptMeta::default()).await.unwrap();

    let mut completes = 0;
    let mut saw_sending = false;
    let mut saw_updated = false;
    while let Some(msg) = rx.recv().await {
        match msg {
            ObserverMessage::PromptComplete { .. } => {
                completes += 1;
                if completes == 2 {
                    break;
                }
            }
            ObserverMessage::QueueMessageSending { .. } => saw_sending = true,
            ObserverMessage::QueueUpdated { .. } => saw_updated = true,
            _ => {}
        }
    }

    assert_eq!(completes, 2, "expected the live prompt and the dispatched queued message to each complete");
    assert!(saw_sending, "expected a queue_message_sending notification");
    assert!(saw_updated, "expected a queue_updated notification once the queue drained");
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn capacity_limit_is_enforced_through_manager_api() {
    let mgr = manager(1, TestFactory::new(Duration::ZERO));
    let ws = uuid::Uuid::new_v4();
    mgr.create_session("only".to_string(), ws, "/workspace".to_string(), SessionConfig::default()).await.unwrap();

    let result = mgr.create_session("overflow".to_string(), ws, "/workspace".to_string(), SessionConfig::default()).await;
    assert!(matches!(result, Err(SessionError::Capacity(1))));
    assert_eq!(mgr.session_count().await, 1);
}
