// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The closed set of streaming event kinds a [`crate::session::BackgroundSession`]
//! can buffer, fan out to observers, and persist. See spec §3 "Event".

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tool call, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One entry of an agent-reported plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub status: ToolCallStatus,
}

/// The payload of a single buffered event, tagged by kind.
///
/// `kind()` identifies same-vs-different kind for the buffer's coalescing
/// rule (spec §4.1): two consecutive `AgentMessage`/`AgentThought` events
/// merge; every other kind always starts a new event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    AgentMessage { html: String },
    AgentThought { text: String },
    ToolCall {
        id: String,
        title: String,
        status: ToolCallStatus,
    },
    ToolCallUpdate {
        id: String,
        status: Option<ToolCallStatus>,
    },
    Plan { entries: Option<Vec<PlanEntry>> },
    FileRead { path: String, size: u64 },
    FileWrite { path: String, size: u64 },
}

impl EventData {
    /// Coalescing key. Only `AgentMessage` and `AgentThought` chunks of
    /// the same kind ever coalesce with one another.
    fn kind(&self) -> EventKind {
        match self {
            EventData::AgentMessage { .. } => EventKind::AgentMessage,
            EventData::AgentThought { .. } => EventKind::AgentThought,
            EventData::ToolCall { .. } => EventKind::ToolCall,
            EventData::ToolCallUpdate { .. } => EventKind::ToolCallUpdate,
            EventData::Plan { .. } => EventKind::Plan,
            EventData::FileRead { .. } => EventKind::FileRead,
            EventData::FileWrite { .. } => EventKind::FileWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    AgentMessage,
    AgentThought,
    ToolCall,
    ToolCallUpdate,
    Plan,
    FileRead,
    FileWrite,
}

/// A tagged, sequence-stamped record, as held by the [`crate::buffer::EventBuffer`]
/// and handed to observers and the [`crate::recorder::Recorder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub data: EventData,
}

impl Event {
    pub(crate) fn same_kind(&self, other: &EventData) -> bool {
        self.data.kind() == other.kind()
    }
}

/// Result of an `EventBuffer::append_*` call: whether the payload merged
/// into the prior buffered event ("coalesced") or started a new one, and
/// the seq the caller should report to observers/the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub seq: i64,
    pub coalesced: bool,
}

/// Out-of-band records the session persists directly (never buffered,
/// never coalesced, never replayed to late-joining observers from the
/// event buffer — see spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPromptRecord {
    pub message: String,
    pub image_ids: Vec<String>,
    pub sender: String,
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    UserSelected,
    AutoApprovedNoClient,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub title: String,
    pub option_id: Option<String>,
    pub outcome: PermissionOutcome,
}
