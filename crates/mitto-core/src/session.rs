// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The Background Session: the unit of conversation. See spec §3, §4.4,
//! §4.6, §5.
//!
//! A session binds its two identifiers, the Agent Connection, the Event
//! Buffer, the Observer Set, an optional Recorder, and the prompt state
//! machine described in spec §3's invariants. Three locks guard disjoint
//! state (`promptMu`, `bufferMu`, `observersMu` — the last lives inside
//! [`ObserverSet`]) and are always acquired in that order, never nested
//! the other way, so there is no lock-ordering cycle to deadlock on.
//!
//! Cyclic-reference avoidance (spec §9): the session owns its
//! [`AgentConnection`], but the connection's callbacks only ever hold a
//! [`Weak`] back-reference to the session via [`SessionCallbacks`], so
//! dropping the last external `Arc<BackgroundSession>` tears the cycle
//! down instead of leaking it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;
use crate::connection::{AgentCallbacks, AgentConnection};
use crate::error::{SessionError, SessionResult};
use crate::event::{PermissionOutcome, PlanEntry, ToolCallStatus};
use crate::hooks::{HookInput, HookManager};
use crate::manager::PlanCacheSink;
use crate::observer::{ObserverError, ObserverHandle, ObserverSet, PermissionRequest, PermissionResponse, PromptMeta};
use crate::recorder::Recorder;
use crate::store::Queue;

/// A prepend/append text fragment applied to an outgoing prompt, optionally
/// restricted to a session's first prompt (spec §4.4: "applies message
/// processors (prepend/append fragments gated on `isFirstPrompt`)").
#[derive(Debug, Clone, Default)]
pub struct MessageProcessor {
    pub prepend: Option<String>,
    pub append: Option<String>,
    pub first_prompt_only: bool,
}

impl MessageProcessor {
    fn apply(&self, message: String, is_first_prompt: bool) -> String {
        if self.first_prompt_only && !is_first_prompt {
            return message;
        }
        let mut out = String::new();
        if let Some(p) = &self.prepend {
            out.push_str(p);
        }
        out.push_str(&message);
        if let Some(a) = &self.append {
            out.push_str(a);
        }
        out
    }
}

/// Per-session configuration resolved once at construction time by the
/// caller (typically [`crate::manager::SessionManager`]) from layered
/// `mitto-config` settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auto_approve: bool,
    pub queue_enabled: bool,
    pub queue_delay_seconds: u64,
    pub action_buttons: bool,
    pub history_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            queue_enabled: false,
            queue_delay_seconds: 0,
            action_buttons: true,
            history_turns: 5,
        }
    }
}

/// Everything a caller supplies at construction. `history` is the
/// persisted event log to draw the resumed-session preface from (spec
/// §4.4.2); it is empty for a brand-new session.
pub struct SessionParams {
    pub persisted_id: String,
    pub workspace_id: uuid::Uuid,
    pub working_dir: String,
    pub recorder: Option<Arc<dyn Recorder>>,
    pub queue: Option<Arc<dyn Queue>>,
    pub hooks: Arc<dyn HookManager>,
    pub processors: Vec<MessageProcessor>,
    pub config: SessionConfig,
    pub is_resumed: bool,
    pub history: Vec<(String, String)>, // (role, text) turns, oldest first
    /// Where to mirror the most recent plan entries so a caller can
    /// redisplay them without waiting for the next plan event (spec §4.7).
    /// `None` if the caller has no cache to maintain.
    pub plan_cache: Option<Arc<dyn PlanCacheSink>>,
}

struct PromptState {
    is_prompting: bool,
    prompt_count: u64,
    last_response_complete: Option<DateTime<Utc>>,
    is_first_prompt: bool,
    history_injected: bool,
}

impl Default for PromptState {
    fn default() -> Self {
        Self {
            is_prompting: false,
            prompt_count: 0,
            last_response_complete: None,
            is_first_prompt: true,
            history_injected: false,
        }
    }
}

struct SessionBuffer {
    events: EventBuffer,
    next_seq: i64,
}

impl Default for SessionBuffer {
    fn default() -> Self {
        Self {
            events: EventBuffer::new(),
            next_seq: 1,
        }
    }
}

pub struct BackgroundSession {
    persisted_id: String,
    agent_session_id: tokio::sync::RwLock<Option<String>>,
    workspace_id: uuid::Uuid,
    working_dir: String,
    connection: Arc<dyn AgentConnection>,
    recorder: Option<Arc<dyn Recorder>>,
    queue: Option<Arc<dyn Queue>>,
    hooks: Arc<dyn HookManager>,
    processors: Vec<MessageProcessor>,
    config: SessionConfig,
    history: Vec<(String, String)>,
    is_resumed: bool,
    plan_cache: Option<Arc<dyn PlanCacheSink>>,

    buffer: AsyncMutex<SessionBuffer>,
    observers: ObserverSet,
    prompt_state: AsyncMutex<PromptState>,
    closed: AtomicBool,
    total_event_count: AtomicI64,
}

/// Forwards Agent Connection callbacks into the session without the
/// connection itself holding a strong reference to it.
struct SessionCallbacks(Weak<BackgroundSession>);

#[async_trait]
impl AgentCallbacks for SessionCallbacks {
    async fn on_agent_message(&self, html: &str) {
        if let Some(s) = self.0.upgrade() {
            s.handle_agent_message(html).await;
        }
    }
    async fn on_agent_thought(&self, text: &str) {
        if let Some(s) = self.0.upgrade() {
            s.handle_agent_thought(text).await;
        }
    }
    async fn on_tool_call(&self, id: &str, title: &str, status: ToolCallStatus) {
        if let Some(s) = self.0.upgrade() {
            s.handle_tool_call(id, title, status).await;
        }
    }
    async fn on_tool_call_update(&self, id: &str, status: Option<ToolCallStatus>) {
        if let Some(s) = self.0.upgrade() {
            s.handle_tool_call_update(id, status).await;
        }
    }
    async fn on_plan(&self, entries: Option<Vec<PlanEntry>>) {
        if let Some(s) = self.0.upgrade() {
            s.handle_plan(entries).await;
        }
    }
    async fn on_file_read(&self, path: &str, size: u64) {
        if let Some(s) = self.0.upgrade() {
            s.handle_file_read(path, size).await;
        }
    }
    async fn on_file_write(&self, path: &str, size: u64) {
        if let Some(s) = self.0.upgrade() {
            s.handle_file_write(path, size).await;
        }
    }
    async fn on_permission(&self, request: PermissionRequest) -> Result<PermissionResponse, ObserverError> {
        match self.0.upgrade() {
            Some(s) => s.handle_permission(request).await,
            None => Ok(PermissionResponse {
                option_id: None,
                cancelled: true,
            }),
        }
    }
}

impl BackgroundSession {
    /// Builds a session and the Agent Connection in one step via
    /// `Arc::new_cyclic`, so `build_connection` can capture a [`Weak`]
    /// handle to the not-yet-complete session for its callbacks.
    pub fn new(
        params: SessionParams,
        build_connection: impl FnOnce(Arc<dyn AgentCallbacks>) -> Arc<dyn AgentConnection>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let callbacks: Arc<dyn AgentCallbacks> = Arc::new(SessionCallbacks(weak.clone()));
            let connection = build_connection(callbacks);
            BackgroundSession {
                persisted_id: params.persisted_id,
                agent_session_id: tokio::sync::RwLock::new(None),
                workspace_id: params.workspace_id,
                working_dir: params.working_dir,
                connection,
                recorder: params.recorder,
                queue: params.queue,
                hooks: params.hooks,
                processors: params.processors,
                config: params.config,
                history: params.history,
                is_resumed: params.is_resumed,
                plan_cache: params.plan_cache,
                buffer: AsyncMutex::new(SessionBuffer::default()),
                observers: ObserverSet::new(),
                prompt_state: AsyncMutex::new(PromptState::default()),
                closed: AtomicBool::new(false),
                total_event_count: AtomicI64::new(0),
            }
        })
    }

    // ── Connection bootstrap ──────────────────────────────────────────────

    /// Initializes the Agent Connection and either loads a prior agent
    /// session or starts a new one. On any failure, kills the child and
    /// ends the recorder with `"failed_to_start"` (spec §4.3, §7 `StartupError`).
    pub async fn connect(&self, prior_agent_session_id: Option<&str>) -> SessionResult<()> {
        let result = self.try_connect(prior_agent_session_id).await;
        if let Err(ref e) = result {
            self.connection.shutdown().await;
            if let Some(rec) = &self.recorder {
                let _ = rec.end("failed_to_start").await;
            }
            warn!(session_id = %self.persisted_id, error = %e, "agent failed to start");
        }
        result
    }

    async fn try_connect(&self, prior_agent_session_id: Option<&str>) -> SessionResult<()> {
        self.connection
            .initialize()
            .await
            .map_err(|e| SessionError::Startup(e.to_string()))?;
        let agent_session_id = if let Some(id) = prior_agent_session_id {
            self.connection
                .load_session(id, &self.working_dir)
                .await
                .map_err(|e| SessionError::Startup(e.to_string()))?;
            id.to_string()
        } else {
            self.connection
                .new_session(&self.working_dir)
                .await
                .map_err(|e| SessionError::Startup(e.to_string()))?
        };
        *self.agent_session_id.write().await = Some(agent_session_id.clone());

        if let Some(rec) = &self.recorder {
            if self.is_resumed {
                if let Err(e) = rec.resume().await {
                    warn!(session_id = %self.persisted_id, error = %e, "failed to persist session resume");
                }
                // Seed nextSeq from the persisted log so resumed events never
                // collide with seqs already written (spec §3, §8 property 2).
                match rec.event_count().await {
                    Ok(count) => {
                        self.buffer.lock().await.next_seq = count as i64 + 1;
                    }
                    Err(e) => {
                        warn!(session_id = %self.persisted_id, error = %e, "failed to read event count for seq recovery");
                    }
                }
            } else if let Err(e) = rec.start(&agent_session_id, &self.working_dir).await {
                warn!(session_id = %self.persisted_id, error = %e, "failed to persist session start");
            }
        }
        Ok(())
    }

    // ── Public contract (spec §4.4) ───────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.persisted_id
    }

    pub async fn acp_id(&self) -> Option<String> {
        self.agent_session_id.read().await.clone()
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn workspace_id(&self) -> uuid::Uuid {
        self.workspace_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_prompting(&self) -> bool {
        self.prompt_state.lock().await.is_prompting
    }

    pub async fn prompt_count(&self) -> u64 {
        self.prompt_state.lock().await.prompt_count
    }

    pub fn event_count(&self) -> i64 {
        self.total_event_count.load(Ordering::SeqCst)
    }

    pub async fn last_response_complete(&self) -> Option<DateTime<Utc>> {
        self.prompt_state.lock().await.last_response_complete
    }

    pub fn observer_count(&self) -> usize {
        self.observers.count()
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub(crate) fn queue(&self) -> Option<&Arc<dyn Queue>> {
        self.queue.as_ref()
    }

    pub(crate) fn queue_delay_seconds(&self) -> u64 {
        self.config.queue_delay_seconds
    }

    pub(crate) fn queue_enabled(&self) -> bool {
        self.config.queue_enabled
    }

    /// Registers `observer`. If a prompt is in flight, replays the buffer
    /// accumulated so far before returning (spec §4.2, property 8).
    ///
    /// The buffer lock is held across both the snapshot and the insert: a
    /// callback appending a new event while this is in flight would
    /// otherwise be able to slip between the two, landing in neither the
    /// replay nor this observer's future live delivery.
    pub async fn add_observer(&self, observer: Arc<dyn crate::observer::Observer>) -> ObserverHandle {
        let prompting = self.prompt_state.lock().await.is_prompting;
        if !prompting {
            return self.observers.add(observer, None);
        }
        let buf = self.buffer.lock().await;
        let replay = buf.events.events();
        self.observers.add(observer, Some(&replay))
    }

    pub fn remove_observer(&self, handle: ObserverHandle) {
        self.observers.remove(handle);
    }

    pub(crate) fn notify_queue_message_sending(&self, id: &str) {
        self.observers.notify_all(|o| o.on_queue_message_sending(id));
    }

    pub(crate) fn notify_queue_message_sent(&self, id: &str) {
        self.observers.notify_all(|o| o.on_queue_message_sent(id));
    }

    pub(crate) fn notify_queue_updated(&self, len: usize, action: &str, id: &str) {
        self.observers.notify_all(|o| o.on_queue_updated(len, action, id));
    }

    /// Accepts a user prompt and returns once it has been accepted and
    /// handed off; the agent's response streams asynchronously through
    /// the registered observers.
    pub async fn prompt(self: &Arc<Self>, message: String, image_ids: Vec<String>, meta: PromptMeta) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.agent_session_id.read().await.is_none() {
            return Err(SessionError::NoConnection);
        }

        let is_first_prompt = {
            let mut state = self.prompt_state.lock().await;
            if state.is_prompting {
                return Err(SessionError::Busy);
            }
            state.is_prompting = true;
            state.prompt_count += 1;
            state.is_first_prompt
        };
        if let Some(sink) = &self.plan_cache {
            sink.clear(&self.persisted_id);
        }

        info!(session_id = %self.persisted_id, prompt_count = %self.prompt_state.lock().await.prompt_count, "prompt accepted");

        if let Some(rec) = &self.recorder {
            if let Err(e) = rec.record_user_prompt(&message, &image_ids, meta.sender.as_deref().unwrap_or("user")).await {
                warn!(session_id = %self.persisted_id, error = %e, "failed to persist user prompt");
            }
        }
        self.observers.notify_all(|o| o.on_user_prompt(&message, &meta));

        let mut text = message;
        for p in &self.processors {
            text = p.apply(text, is_first_prompt);
        }

        let hook_out = match self
            .hooks
            .apply(HookInput {
                message: text.clone(),
                image_ids: image_ids.clone(),
            })
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(session_id = %self.persisted_id, error = %e, "hook failed, continuing untransformed");
                if let Some(rec) = &self.recorder {
                    let _ = rec.record_error(&format!("hook failed: {e}")).await;
                }
                crate::hooks::HookOutput {
                    message: text.clone(),
                    attachments: image_ids.clone(),
                }
            }
        };

        let mut final_message = hook_out.message;
        let final_images = hook_out.attachments;

        if self.is_resumed && is_first_prompt {
            let needs_injection = {
                let state = self.prompt_state.lock().await;
                !state.history_injected
            };
            if needs_injection {
                if let Some(preface) = self.build_history_preface() {
                    final_message = format!("{preface}{final_message}");
                }
                self.prompt_state.lock().await.history_injected = true;
            }
        }

        {
            let mut state = self.prompt_state.lock().await;
            state.is_first_prompt = false;
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.run_prompt_to_completion(final_message, final_images).await;
        });
        Ok(())
    }

    /// Builds the bounded history preface for the first prompt of a
    /// resumed session (spec §4.4.2): the last `history_turns` turns,
    /// truncated rather than streaming the whole log.
    fn build_history_preface(&self) -> Option<String> {
        if self.history.is_empty() {
            return None;
        }
        let n = self.config.history_turns;
        let start = self.history.len().saturating_sub(n);
        let mut preface = String::from("Prior conversation summary:\n");
        for (role, text) in &self.history[start..] {
            preface.push_str(&format!("- {role}: {text}\n"));
        }
        preface.push('\n');
        Some(preface)
    }

    async fn run_prompt_to_completion(self: Arc<Self>, message: String, images: Vec<String>) {
        let result = self.connection.prompt(&message, &images).await;
        let event_count = self.event_count() as usize;

        match result {
            Ok(()) => {
                self.observers.notify_all(|o| o.on_prompt_complete(event_count));
                if self.config.action_buttons {
                    self.maybe_suggest_followups().await;
                }
            }
            Err(e) => {
                warn!(session_id = %self.persisted_id, error = %e, "agent protocol error mid-prompt");
                if let Some(rec) = &self.recorder {
                    let _ = rec.record_error(&e.to_string()).await;
                }
                self.observers.notify_all(|o| o.on_error(&e.to_string()));
            }
        }

        {
            let mut buf = self.buffer.lock().await;
            let _ = buf.events.flush();
        }
        {
            let mut state = self.prompt_state.lock().await;
            state.is_prompting = false;
            state.last_response_complete = Some(Utc::now());
        }

        crate::queue::dispatch_after_completion(&self).await;
    }

    /// Heuristic follow-up suggestion pass over the turn's accumulated
    /// agent text; the buffer has already been flushed by the time this
    /// runs, so it only has an effect if overridden to run earlier. Kept
    /// deliberately simple (spec calls this "optional").
    async fn maybe_suggest_followups(&self) {
        debug!(session_id = %self.persisted_id, "action-button follow-up analysis skipped (no agent text retained post-flush)");
    }

    pub async fn cancel(&self) {
        if let Err(e) = self.connection.cancel().await {
            debug!(session_id = %self.persisted_id, error = %e, "cancel forwarded with error (no prompt in flight is fine)");
        }
    }

    /// Idempotent. Cancels the agent, flushes the buffer, kills the
    /// process, and writes exactly one terminal recorder event.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.connection.cancel().await;
        {
            let mut buf = self.buffer.lock().await;
            let _ = buf.events.flush();
        }
        self.connection.shutdown().await;
        if let Some(rec) = &self.recorder {
            if let Err(e) = rec.end(reason).await {
                warn!(session_id = %self.persisted_id, error = %e, "failed to persist terminal recorder event");
            }
        }
        info!(session_id = %self.persisted_id, reason, "session closed");
    }

    /// Flushes the buffer and marks the recorder suspended while leaving
    /// session metadata "active" (spec §4.4; kept for back-compat, see
    /// spec §9 open question 1).
    pub async fn suspend(&self) {
        {
            let mut buf = self.buffer.lock().await;
            let _ = buf.events.flush();
        }
        if let Some(rec) = &self.recorder {
            let _ = rec.suspend().await;
        }
    }

    /// Delivers an answer to a pending permission request. In this
    /// design permission requests are resolved synchronously inside
    /// `on_permission` via the first attached observer, so this method
    /// exists for API completeness with transports that model the
    /// rendezvous as two separate calls; it is a no-op here since there
    /// is no separate pending-request slot to answer into.
    pub fn answer_permission(&self, _option_id: Option<&str>, _cancel: bool) {
        debug!(session_id = %self.persisted_id, "answer_permission called; handled inline by the first observer's on_permission");
    }

    // ── Internal callback routing (spec §4.4.1) ───────────────────────────

    async fn handle_agent_message(&self, html: &str) {
        if self.is_closed() {
            return;
        }
        let (seq, coalesced) = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_agent_message(&mut buf.next_seq, html);
            if !outcome.coalesced {
                self.total_event_count.fetch_add(1, Ordering::SeqCst);
            }
            (outcome.seq, outcome.coalesced)
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_agent_message(seq, html).await;
        }
        debug!(session_id = %self.persisted_id, seq, event_kind = "agent_message", "fan out");
        self.observers.notify_all(|o| o.on_agent_message(seq, html, coalesced));
    }

    async fn handle_agent_thought(&self, text: &str) {
        if self.is_closed() {
            return;
        }
        let (seq, coalesced) = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_agent_thought(&mut buf.next_seq, text);
            if !outcome.coalesced {
                self.total_event_count.fetch_add(1, Ordering::SeqCst);
            }
            (outcome.seq, outcome.coalesced)
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_agent_thought(seq, text).await;
        }
        debug!(session_id = %self.persisted_id, seq, event_kind = "agent_thought", "fan out");
        self.observers.notify_all(|o| o.on_agent_thought(seq, text, coalesced));
    }

    async fn handle_tool_call(&self, id: &str, title: &str, status: ToolCallStatus) {
        if self.is_closed() {
            return;
        }
        let seq = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_tool_call(&mut buf.next_seq, id, title, status.clone());
            self.total_event_count.fetch_add(1, Ordering::SeqCst);
            outcome.seq
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_tool_call(seq, id, title, &status).await;
        }
        debug!(session_id = %self.persisted_id, seq, event_kind = "tool_call", "fan out");
        self.observers.notify_all(|o| o.on_tool_call(seq, id, title, &status));
    }

    async fn handle_tool_call_update(&self, id: &str, status: Option<ToolCallStatus>) {
        if self.is_closed() {
            return;
        }
        let seq = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_tool_call_update(&mut buf.next_seq, id, status.clone());
            self.total_event_count.fetch_add(1, Ordering::SeqCst);
            outcome.seq
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_tool_call_update(seq, id, status.as_ref()).await;
        }
        debug!(session_id = %self.persisted_id, seq, event_kind = "tool_call_update", "fan out");
        self.observers.notify_all(|o| o.on_tool_call_update(seq, id, status.as_ref()));
    }

    async fn handle_plan(&self, entries: Option<Vec<PlanEntry>>) {
        if self.is_closed() {
            return;
        }
        let seq = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_plan(&mut buf.next_seq, entries.clone());
            self.total_event_count.fetch_add(1, Ordering::SeqCst);
            outcome.seq
        };
        if let Some(rec) = &self.recorder {
            let json = serde_json::to_string(&entries).unwrap_or_default();
            let _ = rec.record_plan(seq, &json).await;
        }
        if let Some(sink) = &self.plan_cache {
            match &entries {
                Some(e) => sink.record(&self.persisted_id, e.clone()),
                None => sink.clear(&self.persisted_id),
            }
        }
        debug!(session_id = %self.persisted_id, seq, event_kind = "plan", "fan out");
        self.observers.notify_all(|o| o.on_plan(seq, entries.as_deref()));
    }

    async fn handle_file_read(&self, path: &str, size: u64) {
        if self.is_closed() {
            return;
        }
        let seq = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_file_read(&mut buf.next_seq, path, size);
            self.total_event_count.fetch_add(1, Ordering::SeqCst);
            outcome.seq
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_file_read(seq, path, size).await;
        }
        self.observers.notify_all(|o| o.on_file_read(seq, path, size));
    }

    async fn handle_file_write(&self, path: &str, size: u64) {
        if self.is_closed() {
            return;
        }
        let seq = {
            let mut buf = self.buffer.lock().await;
            let outcome = buf.events.append_file_write(&mut buf.next_seq, path, size);
            self.total_event_count.fetch_add(1, Ordering::SeqCst);
            outcome.seq
        };
        if let Some(rec) = &self.recorder {
            let _ = rec.record_file_write(seq, path, size).await;
        }
        self.observers.notify_all(|o| o.on_file_write(seq, path, size));
    }

    // ── Permission protocol (spec §4.6) ───────────────────────────────────

    async fn handle_permission(&self, request: PermissionRequest) -> Result<PermissionResponse, ObserverError> {
        if self.is_closed() {
            return Ok(PermissionResponse {
                option_id: None,
                cancelled: true,
            });
        }
        let observers = self.observers.snapshot();
        if observers.is_empty() {
            return Ok(if self.config.auto_approve {
                let option_id = request.options.iter().find(|o| o.permissive).map(|o| o.id.clone());
                self.persist_permission(&request.tool_title, option_id.as_deref(), PermissionOutcome::AutoApprovedNoClient)
                    .await;
                PermissionResponse {
                    option_id,
                    cancelled: false,
                }
            } else {
                self.persist_permission(&request.tool_title, None, PermissionOutcome::Cancelled).await;
                PermissionResponse {
                    option_id: None,
                    cancelled: true,
                }
            });
        }

        let first = observers[0].clone();
        let req_for_blocking = request.clone();
        // The observer's own `on_permission` may block its calling thread
        // (e.g. ChannelObserver's reply rendezvous); run it off the async
        // worker thread so it can never stall the runtime.
        let outcome = tokio::task::spawn_blocking(move || first.on_permission(&req_for_blocking)).await;

        match outcome {
            Ok(Ok(resp)) => {
                let permission_outcome = if resp.cancelled {
                    PermissionOutcome::Cancelled
                } else {
                    PermissionOutcome::UserSelected
                };
                self.persist_permission(&request.tool_title, resp.option_id.as_deref(), permission_outcome).await;
                Ok(resp)
            }
            _ => {
                self.persist_permission(&request.tool_title, None, PermissionOutcome::Cancelled).await;
                Ok(PermissionResponse {
                    option_id: None,
                    cancelled: true,
                })
            }
        }
    }

    async fn persist_permission(&self, title: &str, option_id: Option<&str>, outcome: PermissionOutcome) {
        if let Some(rec) = &self.recorder {
            let _ = rec.record_permission(title, option_id, outcome).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnection, ScriptedEvent};
    use crate::hooks::NoopHookManager;
    use crate::observer::PermissionOption;
    use crate::recorder::MemoryRecorder;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recording {
        messages: StdMutex<Vec<String>>,
        completes: StdMutex<Vec<usize>>,
    }

    impl crate::observer::Observer for Recording {
        fn on_agent_message(&self, seq: i64, html: &str, coalesced: bool) {
            self.messages.lock().unwrap().push(format!("{seq}:{html}:{coalesced}"));
        }
        fn on_tool_call(&self, seq: i64, id: &str, title: &str, status: &ToolCallStatus) {
            self.messages.lock().unwrap().push(format!("{seq}:tool_call:{id}:{title}:{status:?}"));
        }
        fn on_tool_call_update(&self, seq: i64, id: &str, status: Option<&ToolCallStatus>) {
            self.messages.lock().unwrap().push(format!("{seq}:tool_call_update:{id}:{status:?}"));
        }
        fn on_prompt_complete(&self, event_count: usize) {
            self.completes.lock().unwrap().push(event_count);
        }
    }

    fn new_test_session(turns: Vec<Vec<ScriptedEvent>>, config: SessionConfig) -> (Arc<BackgroundSession>, Arc<MemoryRecorder>) {
        let recorder = Arc::new(MemoryRecorder::new("s1"));
        let params = SessionParams {
            persisted_id: "s1".to_string(),
            workspace_id: uuid::Uuid::new_v4(),
            working_dir: "/w".to_string(),
            recorder: Some(recorder.clone() as Arc<dyn Recorder>),
            queue: None,
            hooks: Arc::new(NoopHookManager),
            processors: Vec::new(),
            config,
            is_resumed: false,
            history: Vec::new(),
            plan_cache: None,
        };
        let session = BackgroundSession::new(params, move |callbacks| Arc::new(MockConnection::new(callbacks, turns)));
        (session, recorder)
    }

    #[tokio::test]
    async fn s1_scenario_delivers_in_order_and_completes() {
        let turn = vec![
            ScriptedEvent::AgentMessage("<p>Hi".to_string()),
            ScriptedEvent::AgentMessage(" there</p>".to_string()),
            ScriptedEvent::ToolCall {
                id: "t1".into(),
                title: "read".into(),
                status: ToolCallStatus::Running,
            },
            ScriptedEvent::ToolCallUpdate {
                id: "t1".into(),
                status: Some(ToolCallStatus::Completed),
            },
            ScriptedEvent::AgentMessage("<p>Done</p>".to_string()),
        ];
        let (session, _rec) = new_test_session(vec![turn], SessionConfig::default());
        session.connect(None).await.unwrap();

        let observer = Arc::new(Recording::default());
        session.add_observer(observer.clone()).await;

        session.prompt("hello".to_string(), vec![], PromptMeta::default()).await.unwrap();

        for _ in 0..50 {
            if !observer.completes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let msgs = observer.messages.lock().unwrap().clone();
        assert_eq!(
            msgs,
            vec![
                "1:<p>Hi:false".to_string(),
                "1:<p>Hi there</p>:true".to_string(),
                "2:tool_call:t1:read:Running".to_string(),
                "3:tool_call_update:t1:Some(Completed)".to_string(),
                "4:<p>Done</p>:false".to_string(),
            ]
        );
        assert_eq!(observer.completes.lock().unwrap().as_slice(), [4]);
    }

    #[tokio::test]
    async fn busy_rejects_second_prompt_without_incrementing_count() {
        let (session, _rec) = new_test_session(vec![], SessionConfig::default());
        session.connect(None).await.unwrap();
        session.prompt_state.lock().await.is_prompting = true;
        let count_before = session.prompt_count().await;

        let result = session.prompt("second".to_string(), vec![], PromptMeta::default()).await;
        assert!(matches!(result, Err(SessionError::Busy)));
        assert_eq!(session.prompt_count().await, count_before);
    }

    #[tokio::test]
    async fn closed_session_rejects_prompt() {
        let (session, _rec) = new_test_session(vec![], SessionConfig::default());
        session.connect(None).await.unwrap();
        session.close("user_closed").await;
        let result = session.prompt("hi".to_string(), vec![], PromptMeta::default()).await;
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_recorder_once() {
        let (session, rec) = new_test_session(vec![], SessionConfig::default());
        session.connect(None).await.unwrap();
        session.close("user_closed").await;
        session.close("user_closed").await;
        let ends = rec.entries().await.into_iter().filter(|e| e.starts_with("end ")).count();
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn auto_approve_with_no_observers_selects_permissive_option() {
        let (session, rec) = new_test_session(
            vec![],
            SessionConfig {
                auto_approve: true,
                ..SessionConfig::default()
            },
        );
        session.connect(None).await.unwrap();
        let request = PermissionRequest {
            tool_title: "write file".into(),
            options: vec![
                PermissionOption {
                    id: "deny".into(),
                    label: "Deny".into(),
                    permissive: false,
                },
                PermissionOption {
                    id: "allow".into(),
                    label: "Allow".into(),
                    permissive: true,
                },
            ],
        };
        let resp = session.handle_permission(request).await.unwrap();
        assert_eq!(resp.option_id.as_deref(), Some("allow"));
        assert!(!resp.cancelled);
        assert!(rec.entries().await.iter().any(|e| e.contains("AutoApprovedNoClient")));
    }

    #[tokio::test]
    async fn no_auto_approve_with_no_observers_cancels() {
        let (session, _rec) = new_test_session(vec![], SessionConfig::default());
        session.connect(None).await.unwrap();
        let request = PermissionRequest {
            tool_title: "write file".into(),
            options: vec![],
        };
        let resp = session.handle_permission(request).await.unwrap();
        assert!(resp.cancelled);
    }
}
