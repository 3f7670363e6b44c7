// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`. `#[serde(default)]` on a `bool` always falls back to
/// `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_history_turns() -> usize {
    5
}

fn default_max_sessions() -> usize {
    32
}

fn default_queue_delay_seconds() -> u64 {
    0
}

/// Top-level configuration, assembled from the global layer, the workspace
/// `.mittorc`, and (at call time) a server-specific override supplied by the
/// caller. See [`crate::load`] for the merge order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workspace used when a session is created without an explicit
    /// workspace argument and the working directory matches none of
    /// `workspaces`.
    #[serde(default)]
    pub default_workspace: Option<Uuid>,
    /// Global auto-approve flag. First positive wins across
    /// global → per-server → per-workspace (see [`Config::resolve_auto_approve`]).
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub queue: QueueDefaults,
    /// Whether follow-up action-button suggestions are computed after a
    /// turn ends with stop reason "end of turn".
    #[serde(default = "default_true")]
    pub action_buttons: bool,
    /// Number of prior turns folded into the history preface injected on
    /// the first prompt of a resumed session.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Hard cap on concurrently live background sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Known workspaces, keyed by their stable uuid.
    #[serde(default)]
    pub workspaces: HashMap<Uuid, WorkspaceSettings>,
    /// Known ACP server profiles, keyed by name (the name stored alongside
    /// a session's persisted metadata; see spec §4.7's "re-derive the ACP
    /// command from configuration").
    #[serde(default)]
    pub servers: HashMap<String, ServerSettings>,
}

impl Config {
    /// Resolve the effective auto-approve flag for a prompt running under
    /// `server` in `workspace`. Global wins first, then the server's own
    /// setting, then the workspace's; a later `false` never overrides an
    /// earlier `true` — only the first positive found, in that order, wins.
    pub fn resolve_auto_approve(&self, server: Option<&str>, workspace: Option<&Uuid>) -> bool {
        if self.auto_approve {
            return true;
        }
        if let Some(server) = server {
            if let Some(s) = self.servers.get(server) {
                if s.auto_approve == Some(true) {
                    return true;
                }
            }
        }
        if let Some(ws) = workspace {
            if let Some(w) = self.workspaces.get(ws) {
                if w.auto_approve == Some(true) {
                    return true;
                }
            }
        }
        false
    }

    /// Resolve the effective queue configuration for a workspace, falling
    /// back to the global default when the workspace has no override.
    pub fn resolve_queue(&self, workspace: Option<&Uuid>) -> QueueDefaults {
        workspace
            .and_then(|id| self.workspaces.get(id))
            .and_then(|w| w.queue.clone())
            .unwrap_or_else(|| self.queue.clone())
    }
}

/// Per-workspace settings: a (working-directory, agent-server) pair with
/// its own defaults, per spec GLOSSARY's "Workspace".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    pub working_dir: String,
    /// Name of the entry in [`Config::servers`] this workspace runs by
    /// default, e.g. `"claude"` or `"gemini"`.
    pub server: String,
    #[serde(default)]
    pub auto_approve: Option<bool>,
    #[serde(default)]
    pub queue: Option<QueueDefaults>,
}

/// A named ACP server profile: how to spawn the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Argv used to spawn the agent, e.g. `["claude-code-acp"]`.
    pub command: Vec<String>,
    #[serde(default)]
    pub auto_approve: Option<bool>,
    /// Whether the agent supports `session/load` (resuming by agent
    /// session id) — advertised by its `initialize` response in practice,
    /// but configurable here as a static fallback for agents that lie.
    #[serde(default = "default_true")]
    pub supports_load_session: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDefaults {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_queue_delay_seconds")]
    pub delay_seconds: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
