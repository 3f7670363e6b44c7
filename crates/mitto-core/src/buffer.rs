// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory, sequence-stamped event log for one session. See spec §4.1.
//!
//! `nextSeq` assignment and buffer mutation share one lock in the caller
//! (spec §5 lists `bufferMu` as guarding both), so [`EventBuffer`]'s
//! `append_*` methods take `&mut i64` for the counter rather than owning
//! it themselves — the counter conceptually belongs to the session, but
//! only ever advances while the buffer lock is held.
//!
//! Coalescing policy (spec property 7): a chunk that merges into the
//! previous buffered event of the same kind reuses that event's seq and
//! does **not** advance the counter; only genuinely new buffered events
//! consume a fresh seq. This is what makes the literal scenario in spec
//! §8 (S1) produce `tool_call` at seq 2 even though two `agent_message`
//! chunks preceded it.

use crate::event::{AppendOutcome, Event, EventData, PlanEntry, ToolCallStatus};

#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<Event>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_agent_message(&mut self, next_seq: &mut i64, html: &str) -> AppendOutcome {
        self.append_text(next_seq, EventData::AgentMessage { html: html.to_string() }, |last| {
            if let EventData::AgentMessage { html: existing } = last {
                *existing = existing.clone() + html;
                true
            } else {
                false
            }
        })
    }

    pub fn append_agent_thought(&mut self, next_seq: &mut i64, text: &str) -> AppendOutcome {
        self.append_text(next_seq, EventData::AgentThought { text: text.to_string() }, |last| {
            if let EventData::AgentThought { text: existing } = last {
                *existing = existing.clone() + text;
                true
            } else {
                false
            }
        })
    }

    /// Shared coalesce-or-append logic for the two text kinds. `merge`
    /// mutates the last event in place and returns whether it matched.
    fn append_text(
        &mut self,
        next_seq: &mut i64,
        fresh: EventData,
        merge: impl FnOnce(&mut EventData) -> bool,
    ) -> AppendOutcome {
        if let Some(last) = self.events.last_mut() {
            if last.same_kind(&fresh) && merge(&mut last.data) {
                return AppendOutcome {
                    seq: last.seq,
                    coalesced: true,
                };
            }
        }
        self.push_new(next_seq, fresh)
    }

    pub fn append_tool_call(
        &mut self,
        next_seq: &mut i64,
        id: &str,
        title: &str,
        status: ToolCallStatus,
    ) -> AppendOutcome {
        self.push_new(
            next_seq,
            EventData::ToolCall {
                id: id.to_string(),
                title: title.to_string(),
                status,
            },
        )
    }

    pub fn append_tool_call_update(
        &mut self,
        next_seq: &mut i64,
        id: &str,
        status: Option<ToolCallStatus>,
    ) -> AppendOutcome {
        self.push_new(
            next_seq,
            EventData::ToolCallUpdate {
                id: id.to_string(),
                status,
            },
        )
    }

    pub fn append_plan(
        &mut self,
        next_seq: &mut i64,
        entries: Option<Vec<PlanEntry>>,
    ) -> AppendOutcome {
        self.push_new(next_seq, EventData::Plan { entries })
    }

    pub fn append_file_read(&mut self, next_seq: &mut i64, path: &str, size: u64) -> AppendOutcome {
        self.push_new(
            next_seq,
            EventData::FileRead {
                path: path.to_string(),
                size,
            },
        )
    }

    pub fn append_file_write(&mut self, next_seq: &mut i64, path: &str, size: u64) -> AppendOutcome {
        self.push_new(
            next_seq,
            EventData::FileWrite {
                path: path.to_string(),
                size,
            },
        )
    }

    fn push_new(&mut self, next_seq: &mut i64, data: EventData) -> AppendOutcome {
        let seq = *next_seq;
        *next_seq += 1;
        self.events.push(Event { seq, data });
        AppendOutcome {
            seq,
            coalesced: false,
        }
    }

    /// Snapshot copy of all buffered events, in order, for replay to a
    /// newly-added observer.
    pub fn events(&self) -> Vec<Event> {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns and clears all buffered events, in ascending seq order.
    pub fn flush(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Concatenation of every `AgentMessage` payload, in order.
    pub fn agent_message_text(&self) -> String {
        self.concat_kind(|d| matches!(d, EventData::AgentMessage { .. }), |d| match d {
            EventData::AgentMessage { html } => html.as_str(),
            _ => unreachable!(),
        })
    }

    /// Concatenation of every `AgentThought` payload, in order.
    pub fn agent_thought_text(&self) -> String {
        self.concat_kind(|d| matches!(d, EventData::AgentThought { .. }), |d| match d {
            EventData::AgentThought { text } => text.as_str(),
            _ => unreachable!(),
        })
    }

    fn concat_kind(
        &self,
        matches: impl Fn(&EventData) -> bool,
        text_of: impl Fn(&EventData) -> &str,
    ) -> String {
        self.events
            .iter()
            .map(|e| &e.data)
            .filter(|d| matches(d))
            .map(text_of)
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
