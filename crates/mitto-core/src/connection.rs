// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The Agent Conversation Protocol stub: a connection to one child agent
//! process. See spec §4.3.
//!
//! This module deliberately speaks a minimal line-delimited JSON-RPC-style
//! framing over the child's stdio rather than any particular published
//! protocol crate: the wire format itself is an implementation detail a
//! [`BackgroundSession`](crate::session::BackgroundSession) never sees
//! directly, since every callback crosses the [`AgentCallbacks`] boundary
//! first.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::event::{PlanEntry, ToolCallStatus};
use crate::observer::{ObserverError, PermissionRequest, PermissionResponse};

/// Errors arising from starting or talking to the agent subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent process exited before initialization completed")]
    ExitedEarly,
    #[error("malformed message from agent: {0}")]
    Protocol(String),
    #[error("i/o error talking to agent: {0}")]
    Io(#[source] std::io::Error),
}

/// The callback surface a connection drives as it parses agent output.
/// [`BackgroundSession`](crate::session::BackgroundSession) implements
/// this trait directly; a test double can record calls without touching
/// any process machinery.
#[async_trait]
pub trait AgentCallbacks: Send + Sync {
    async fn on_agent_message(&self, html: &str);
    async fn on_agent_thought(&self, text: &str);
    async fn on_tool_call(&self, id: &str, title: &str, status: ToolCallStatus);
    async fn on_tool_call_update(&self, id: &str, status: Option<ToolCallStatus>);
    async fn on_plan(&self, entries: Option<Vec<PlanEntry>>);
    async fn on_file_read(&self, path: &str, size: u64);
    async fn on_file_write(&self, path: &str, size: u64);
    /// Blocks the caller (the connection's reader task) until answered.
    async fn on_permission(&self, request: PermissionRequest) -> Result<PermissionResponse, ObserverError>;
}

/// A live or resumed conversation with one agent process.
///
/// `Initialize` must run before any other call; `LoadSession` and
/// `NewSession` are mutually exclusive ways of entering the conversation
/// (spec §4.3). Implementations own the child process and any reader
/// task driving `callbacks`.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    async fn initialize(&self) -> Result<(), ConnectError>;
    async fn new_session(&self, cwd: &str) -> Result<String, ConnectError>;
    async fn load_session(&self, agent_session_id: &str, cwd: &str) -> Result<(), ConnectError>;
    /// Drives the agent until it emits a stop event, delivering every
    /// streaming callback through `callbacks` as it goes. Returns once the
    /// turn is complete (spec's `StopReason`-equivalent is absorbed into
    /// the callback stream itself, matching how `BackgroundSession` only
    /// needs to know "done" vs "error").
    async fn prompt(&self, message: &str, image_paths: &[String]) -> Result<(), ConnectError>;
    async fn cancel(&self) -> Result<(), ConnectError>;
    /// Kills the child process, if any. Called from `Close` (spec §4.4);
    /// the default no-op suits test doubles with no process to kill.
    async fn shutdown(&self) {}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
enum Outbound {
    Initialize,
    NewSession { cwd: String },
    LoadSession { session_id: String, cwd: String },
    Prompt { message: String, image_paths: Vec<String> },
    Cancel,
    PermissionResponse { option_id: Option<String>, cancelled: bool },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum Inbound {
    SessionStarted { session_id: String },
    AgentMessage { html: String },
    AgentThought { text: String },
    ToolCall { id: String, title: String, status: ToolCallStatus },
    ToolCallUpdate { id: String, status: Option<ToolCallStatus> },
    Plan { entries: Option<Vec<PlanEntry>> },
    FileRead { path: String, size: u64 },
    FileWrite { path: String, size: u64 },
    PermissionRequest { request: PermissionRequest },
    StopTurn,
    Error { message: String },
}

/// Spawns the configured agent binary as a child process and speaks
/// newline-delimited JSON over its stdin/stdout.
pub struct ProcessAgentConnection {
    command: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    callbacks: Arc<dyn AgentCallbacks>,
    /// The agent's own permission-reply channel, so a reader task blocked
    /// on a permission request can be unblocked from `send_permission_response`.
    reply_tx: mpsc::UnboundedSender<PermissionResponse>,
    reply_rx: Mutex<mpsc::UnboundedReceiver<PermissionResponse>>,
    /// Signals turn completion (`StopTurn`) or failure (`Error`, or the
    /// child exiting) back to whichever call is blocked in `prompt`.
    turn_tx: mpsc::UnboundedSender<Result<(), ConnectError>>,
    turn_rx: Mutex<mpsc::UnboundedReceiver<Result<(), ConnectError>>>,
    /// Carries the real agent-assigned id out of the reader task and back
    /// to `new_session`.
    session_id_tx: mpsc::UnboundedSender<String>,
    session_id_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ProcessAgentConnection {
    pub fn new(command: impl Into<String>, args: Vec<String>, callbacks: Arc<dyn AgentCallbacks>) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (session_id_tx, session_id_rx) = mpsc::unbounded_channel();
        Self {
            command: command.into(),
            args,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            callbacks,
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            turn_tx,
            turn_rx: Mutex::new(turn_rx),
            session_id_tx,
            session_id_rx: Mutex::new(session_id_rx),
        }
    }

    async fn write_line(&self, msg: &Outbound) -> Result<(), ConnectError> {
        let mut line = serde_json::to_string(msg).map_err(|e| ConnectError::Protocol(e.to_string()))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ConnectError::ExitedEarly)?;
        stdin.write_all(line.as_bytes()).await.map_err(ConnectError::Io)?;
        stdin.flush().await.map_err(ConnectError::Io)
    }
}

#[async_trait]
impl AgentConnection for ProcessAgentConnection {
    async fn initialize(&self) -> Result<(), ConnectError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(ConnectError::Spawn)?;

        let stdin = child.stdin.take().ok_or(ConnectError::ExitedEarly)?;
        let stdout = child.stdout.take().ok_or(ConnectError::ExitedEarly)?;
        let stderr = child.stderr.take();

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agent_stderr", "{line}");
                }
            });
        }

        let callbacks = self.callbacks.clone();
        let reply_tx = self.reply_tx.clone();
        let turn_tx = self.turn_tx.clone();
        let session_id_tx = self.session_id_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Inbound>(&line) {
                            Ok(msg) => handle_inbound(msg, callbacks.as_ref(), &reply_tx, &turn_tx, &session_id_tx).await,
                            Err(e) => warn!(error = %e, %line, "unparseable agent message"),
                        }
                    }
                    Ok(None) => {
                        info!("agent stdout closed");
                        let _ = turn_tx.send(Err(ConnectError::ExitedEarly));
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        let _ = turn_tx.send(Err(ConnectError::ExitedEarly));
                        break;
                    }
                }
            }
        });

        self.write_line(&Outbound::Initialize).await
    }

    async fn new_session(&self, cwd: &str) -> Result<String, ConnectError> {
        self.write_line(&Outbound::NewSession { cwd: cwd.to_string() }).await?;
        // The session id arrives as a SessionStarted event on the reader
        // task; wait for it here so callers get the real agent-assigned id
        // back instead of having to watch for it themselves.
        self.session_id_rx.lock().await.recv().await.ok_or(ConnectError::ExitedEarly)
    }

    async fn load_session(&self, agent_session_id: &str, cwd: &str) -> Result<(), ConnectError> {
        self.write_line(&Outbound::LoadSession {
            session_id: agent_session_id.to_string(),
            cwd: cwd.to_string(),
        })
        .await
    }

    async fn prompt(&self, message: &str, image_paths: &[String]) -> Result<(), ConnectError> {
        self.write_line(&Outbound::Prompt {
            message: message.to_string(),
            image_paths: image_paths.to_vec(),
        })
        .await?;
        // Block until the reader task observes StopTurn/Error/exit: callers
        // (`BackgroundSession::run_prompt_to_completion`) rely on this
        // returning only once the turn has actually finished streaming.
        self.turn_rx.lock().await.recv().await.ok_or(ConnectError::ExitedEarly)?
    }

    async fn cancel(&self) -> Result<(), ConnectError> {
        self.write_line(&Outbound::Cancel).await
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
    }
}

async fn handle_inbound(
    msg: Inbound,
    callbacks: &dyn AgentCallbacks,
    reply_tx: &mpsc::UnboundedSender<PermissionResponse>,
    turn_tx: &mpsc::UnboundedSender<Result<(), ConnectError>>,
    session_id_tx: &mpsc::UnboundedSender<String>,
) {
    match msg {
        Inbound::SessionStarted { session_id } => {
            debug!(%session_id, "agent session started");
            let _ = session_id_tx.send(session_id);
        }
        Inbound::AgentMessage { html } => callbacks.on_agent_message(&html).await,
        Inbound::AgentThought { text } => callbacks.on_agent_thought(&text).await,
        Inbound::ToolCall { id, title, status } => callbacks.on_tool_call(&id, &title, status).await,
        Inbound::ToolCallUpdate { id, status } => callbacks.on_tool_call_update(&id, status).await,
        Inbound::Plan { entries } => callbacks.on_plan(entries).await,
        Inbound::FileRead { path, size } => callbacks.on_file_read(&path, size).await,
        Inbound::FileWrite { path, size } => callbacks.on_file_write(&path, size).await,
        Inbound::PermissionRequest { request } => {
            match callbacks.on_permission(request).await {
                Ok(resp) => {
                    let _ = reply_tx.send(resp);
                }
                Err(e) => warn!(error = %e, "permission callback failed"),
            }
        }
        Inbound::StopTurn => {
            debug!("agent reported stop_turn");
            let _ = turn_tx.send(Ok(()));
        }
        Inbound::Error { message } => {
            warn!(%message, "agent reported error");
            let _ = turn_tx.send(Err(ConnectError::Protocol(message)));
        }
    }
}

// ─── Test double ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// One scripted event a [`MockConnection`] replays against its
    /// callbacks during `prompt`. Mirrors [`Inbound`] minus the framing.
    pub enum ScriptedEvent {
        AgentMessage(String),
        AgentThought(String),
        ToolCall { id: String, title: String, status: ToolCallStatus },
        ToolCallUpdate { id: String, status: Option<ToolCallStatus> },
        Plan(Option<Vec<PlanEntry>>),
        FileRead { path: String, size: u64 },
        FileWrite { path: String, size: u64 },
        Permission(PermissionRequest),
    }

    /// A scripted [`AgentConnection`] driven purely in-process, for
    /// exercising [`crate::session::BackgroundSession`] without a real
    /// child process. Each `prompt` call drains one turn (a `Vec` of
    /// [`ScriptedEvent`]) and replays it against `callbacks`, the same
    /// callback object the session registered at construction.
    pub struct MockConnection {
        callbacks: Arc<dyn AgentCallbacks>,
        turns: StdMutex<VecDeque<Vec<ScriptedEvent>>>,
        pub prompts_received: StdMutex<Vec<String>>,
        pub cancelled: StdMutex<bool>,
    }

    impl MockConnection {
        pub fn new(callbacks: Arc<dyn AgentCallbacks>, turns: Vec<Vec<ScriptedEvent>>) -> Self {
            Self {
                callbacks,
                turns: StdMutex::new(turns.into()),
                prompts_received: StdMutex::new(Vec::new()),
                cancelled: StdMutex::new(false),
            }
        }
    }

    #[async_trait]
    impl AgentConnection for MockConnection {
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
            self.prompts_received.lock().unwrap().push(message.to_string());
            let turn = self.turns.lock().unwrap().pop_front();
            let Some(turn) = turn else { return Ok(()) };
            for event in turn {
                match event {
                    ScriptedEvent::AgentMessage(html) => self.callbacks.on_agent_message(&html).await,
                    ScriptedEvent::AgentThought(text) => self.callbacks.on_agent_thought(&text).await,
                    ScriptedEvent::ToolCall { id, title, status } => {
                        self.callbacks.on_tool_call(&id, &title, status).await
                    }
                    ScriptedEvent::ToolCallUpdate { id, status } => {
                        self.callbacks.on_tool_call_update(&id, status).await
                    }
                    ScriptedEvent::Plan(entries) => self.callbacks.on_plan(entries).await,
                    ScriptedEvent::FileRead { path, size } => self.callbacks.on_file_read(&path, size).await,
                    ScriptedEvent::FileWrite { path, size } => self.callbacks.on_file_write(&path, size).await,
                    ScriptedEvent::Permission(request) => {
                        let _ = self.callbacks.on_permission(request).await;
                    }
                }
            }
            Ok(())
        }

        async fn cancel(&self) -> Result<(), ConnectError> {
            *self.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }
}
