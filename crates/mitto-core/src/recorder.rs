// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Durable recording of one session's conversation, independent of the
//! in-memory [`crate::buffer::EventBuffer`] used for live fan-out. See
//! spec §3 "Recorder" and §4.1.
//!
//! A [`Recorder`] is the write side of persistence; [`crate::store::Store`]
//! is the read side used at startup/resume. Keeping them as separate
//! traits mirrors how a `BackgroundSession` uses them: it appends through
//! the recorder as events happen, and only ever reads back through the
//! store when reconstructing history on resume.

use async_trait::async_trait;

use crate::event::{PermissionOutcome, PermissionRecord, ToolCallStatus};

#[async_trait]
pub trait Recorder: Send + Sync {
    fn session_id(&self) -> &str;

    /// Number of events recorded so far, used to seed `nextSeq` on resume.
    async fn event_count(&self) -> anyhow::Result<usize>;

    async fn start(&self, agent_session_id: &str, cwd: &str) -> anyhow::Result<()>;
    async fn start_with_command(&self, agent_session_id: &str, cwd: &str, command: &str) -> anyhow::Result<()>;
    async fn resume(&self) -> anyhow::Result<()>;
    async fn suspend(&self) -> anyhow::Result<()>;
    /// `reason` is a free-form tag (`"failed_to_start"`, `"user_closed"`,
    /// `"shutdown"`, ...); the core does not interpret it, only forwards
    /// it for the caller's own event-log rendering (spec §6).
    async fn end(&self, reason: &str) -> anyhow::Result<()>;

    async fn record_user_prompt(&self, message: &str, image_ids: &[String], sender: &str) -> anyhow::Result<()>;
    async fn record_agent_message(&self, seq: i64, html: &str) -> anyhow::Result<()>;
    async fn record_agent_thought(&self, seq: i64, text: &str) -> anyhow::Result<()>;
    async fn record_tool_call(&self, seq: i64, id: &str, title: &str, status: &ToolCallStatus) -> anyhow::Result<()>;
    async fn record_tool_call_update(&self, seq: i64, id: &str, status: Option<&ToolCallStatus>) -> anyhow::Result<()>;
    async fn record_plan(&self, seq: i64, entries_json: &str) -> anyhow::Result<()>;
    async fn record_file_read(&self, seq: i64, path: &str, size: u64) -> anyhow::Result<()>;
    async fn record_file_write(&self, seq: i64, path: &str, size: u64) -> anyhow::Result<()>;
    async fn record_error(&self, message: &str) -> anyhow::Result<()>;
    async fn record_permission(&self, title: &str, option_id: Option<&str>, outcome: PermissionOutcome) -> anyhow::Result<()>;
}

/// An in-memory [`Recorder`] for tests: every call appends to a `Vec` the
/// test can inspect afterward rather than touching disk.
pub struct MemoryRecorder {
    session_id: String,
    log: tokio::sync::Mutex<Vec<String>>,
    event_count: std::sync::atomic::AtomicUsize,
}

impl MemoryRecorder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            log: tokio::sync::Mutex::new(Vec::new()),
            event_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub async fn entries(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    async fn push(&self, line: String) -> anyhow::Result<()> {
        self.log.lock().await.push(line);
        Ok(())
    }

    fn bump(&self) {
        self.event_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn event_count(&self) -> anyhow::Result<usize> {
        Ok(self.event_count.load(std::sync::atomic::Ordering::SeqCst))
    }

    async fn start(&self, agent_session_id: &str, cwd: &str) -> anyhow::Result<()> {
        self.push(format!("start agent_session_id={agent_session_id} cwd={cwd}")).await
    }

    async fn start_with_command(&self, agent_session_id: &str, cwd: &str, command: &str) -> anyhow::Result<()> {
        self.push(format!("start agent_session_id={agent_session_id} cwd={cwd} command={command}")).await
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.push("resume".to_string()).await
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.push("suspend".to_string()).await
    }

    async fn end(&self, reason: &str) -> anyhow::Result<()> {
        self.push(format!("end reason={reason}")).await
    }

    async fn record_user_prompt(&self, message: &str, image_ids: &[String], sender: &str) -> anyhow::Result<()> {
        self.push(format!("user_prompt sender={sender} images={} msg={message}", image_ids.len())).await
    }

    async fn record_agent_message(&self, seq: i64, html: &str) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("agent_message seq={seq} html={html}")).await
    }

    async fn record_agent_thought(&self, seq: i64, text: &str) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("agent_thought seq={seq} text={text}")).await
    }

    async fn record_tool_call(&self, seq: i64, id: &str, title: &str, status: &ToolCallStatus) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("tool_call seq={seq} id={id} title={title} status={status:?}")).await
    }

    async fn record_tool_call_update(&self, seq: i64, id: &str, status: Option<&ToolCallStatus>) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("tool_call_update seq={seq} id={id} status={status:?}")).await
    }

    async fn record_plan(&self, seq: i64, entries_json: &str) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("plan seq={seq} entries={entries_json}")).await
    }

    async fn record_file_read(&self, seq: i64, path: &str, size: u64) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("file_read seq={seq} path={path} size={size}")).await
    }

    async fn record_file_write(&self, seq: i64, path: &str, size: u64) -> anyhow::Result<()> {
        self.bump();
        self.push(format!("file_write seq={seq} path={path} size={size}")).await
    }

    async fn record_error(&self, message: &str) -> anyhow::Result<()> {
        self.push(format!("error msg={message}")).await
    }

    async fn record_permission(&self, title: &str, option_id: Option<&str>, outcome: PermissionOutcome) -> anyhow::Result<()> {
        let record = PermissionRecord {
            title: title.to_string(),
            option_id: option_id.map(str::to_string),
            outcome,
        };
        self.push(format!("permission title={} option_id={:?} outcome={:?}", record.title, record.option_id, record.outcome)).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bumps_event_count_only_for_streaming_events() {
        let rec = MemoryRecorder::new("s1");
        rec.record_user_prompt("hi", &[], "user").await.unwrap();
        rec.record_agent_message(1, "<p>hi</p>").await.unwrap();
        rec.record_tool_call(2, "t1", "read", &ToolCallStatus::Running).await.unwrap();
        assert_eq!(rec.event_count().await.unwrap(), 2);
        assert_eq!(rec.entries().await.len(), 3);
    }

    #[tokio::test]
    async fn end_records_reason() {
        let rec = MemoryRecorder::new("s1");
        rec.end("user_closed").await.unwrap();
        assert!(rec.entries().await[0].contains("user_closed"));
    }
}
