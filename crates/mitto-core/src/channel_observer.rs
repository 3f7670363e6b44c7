// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! A reference [`Observer`] backed by a bounded channel, implementing the
//! backpressure contract spec §5 describes: "Observers expose non-blocking
//! `send`-to-channel semantics; if an observer's outbound buffer is full
//! the message is dropped with a debug log." Transports (WebSocket, P2P,
//! whatever a caller wires up) drain the receiver handed back by
//! [`ChannelObserver::new`] and translate [`ObserverMessage`] into their
//! own wire format; this crate
//! does not speak any wire format itself (spec §1 non-goals).

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::event::{PlanEntry, ToolCallStatus};
use crate::observer::{Observer, ObserverError, PermissionRequest, PermissionResponse, PromptMeta};

/// One fan-out message, mirroring [`Observer`]'s per-type callbacks.
#[derive(Debug, Clone)]
pub enum ObserverMessage {
    AgentMessage { seq: i64, html: String, coalesced: bool },
    AgentThought { seq: i64, text: String, coalesced: bool },
    ToolCall { seq: i64, id: String, title: String, status: ToolCallStatus },
    ToolCallUpdate { seq: i64, id: String, status: Option<ToolCallStatus> },
    Plan { seq: i64, entries: Option<Vec<PlanEntry>> },
    FileRead { seq: i64, path: String, size: u64 },
    FileWrite { seq: i64, path: String, size: u64 },
    UserPrompt { message: String, meta: PromptMeta },
    PromptComplete { event_count: usize },
    Error { message: String },
    QueueMessageSending { id: String },
    QueueMessageSent { id: String },
    QueueUpdated { len: usize, action: String, id: String },
    /// A permission request paired with the reply channel the observer
    /// must answer on.
    Permission {
        request: PermissionRequest,
        reply: oneshot::Sender<PermissionResponse>,
    },
}

pub struct ChannelObserver {
    label: String,
    tx: mpsc::Sender<ObserverMessage>,
}

impl ChannelObserver {
    /// `capacity` bounds the outbound buffer; sends beyond it are dropped,
    /// not queued, so a stalled consumer cannot make the session block.
    pub fn new(label: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ObserverMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                label: label.into(),
                tx,
            },
            rx,
        )
    }

    fn send(&self, msg: ObserverMessage) {
        if self.tx.try_send(msg).is_err() {
            debug!(observer = %self.label, "dropped event: outbound buffer full or closed");
        }
    }
}

impl Observer for ChannelObserver {
    fn on_agent_message(&self, seq: i64, html: &str, coalesced: bool) {
        self.send(ObserverMessage::AgentMessage {
            seq,
            html: html.to_string(),
            coalesced,
        });
    }

    fn on_agent_thought(&self, seq: i64, text: &str, coalesced: bool) {
        self.send(ObserverMessage::AgentThought {
            seq,
            text: text.to_string(),
            coalesced,
        });
    }

    fn on_tool_call(&self, seq: i64, id: &str, title: &str, status: &ToolCallStatus) {
        self.send(ObserverMessage::ToolCall {
            seq,
            id: id.to_string(),
            title: title.to_string(),
            status: status.clone(),
        });
    }

    fn on_tool_call_update(&self, seq: i64, id: &str, status: Option<&ToolCallStatus>) {
        self.send(ObserverMessage::ToolCallUpdate {
            seq,
            id: id.to_string(),
            status: status.cloned(),
        });
    }

    fn on_plan(&self, seq: i64, entries: Option<&[PlanEntry]>) {
        self.send(ObserverMessage::Plan {
            seq,
            entries: entries.map(|e| e.to_vec()),
        });
    }

    fn on_file_read(&self, seq: i64, path: &str, size: u64) {
        self.send(ObserverMessage::FileRead {
            seq,
            path: path.to_string(),
            size,
        });
    }

    fn on_file_write(&self, seq: i64, path: &str, size: u64) {
        self.send(ObserverMessage::FileWrite {
            seq,
            path: path.to_string(),
            size,
        });
    }

    fn on_user_prompt(&self, message: &str, meta: &PromptMeta) {
        self.send(ObserverMessage::UserPrompt {
            message: message.to_string(),
            meta: meta.clone(),
        });
    }

    fn on_prompt_complete(&self, event_count: usize) {
        self.send(ObserverMessage::PromptComplete { event_count });
    }

    fn on_error(&self, message: &str) {
        self.send(ObserverMessage::Error {
            message: message.to_string(),
        });
    }

    fn on_permission(&self, request: &PermissionRequest) -> Result<PermissionResponse, ObserverError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(ObserverMessage::Permission {
                request: request.clone(),
                reply: reply_tx,
            })
            .map_err(|_| ObserverError("observer channel closed or full".to_string()))?;
        // Permission callbacks run on the agent stub's own thread (spec
        // §4.6), not a tokio task, so blocking here is safe and matches
        // the synchronous rendezvous the protocol requires.
        reply_rx
            .blocking_recv()
            .map_err(|_| ObserverError("observer dropped without answering".to_string()))
    }

    fn on_queue_message_sending(&self, id: &str) {
        self.send(ObserverMessage::QueueMessageSending { id: id.to_string() });
    }

    fn on_queue_message_sent(&self, id: &str) {
        self.send(ObserverMessage::QueueMessageSent { id: id.to_string() });
    }

    fn on_queue_updated(&self, len: usize, action: &str, id: &str) {
        self.send(ObserverMessage::QueueUpdated {
            len,
            action: action.to_string(),
            id: id.to_string(),
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let (obs, mut rx) = ChannelObserver::new("test", 1);
        obs.on_agent_message(1, "a", false);
        obs.on_agent_message(2, "b", false); // buffer full: dropped
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ObserverMessage::AgentMessage { seq: 1, .. }));
        // Nothing else should be queued.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn permission_round_trips_through_reply_channel() {
        let (obs, mut rx) = ChannelObserver::new("test", 4);
        let handle = std::thread::spawn(move || {
            obs.on_permission(&PermissionRequest {
                tool_title: "read".into(),
                options: vec![],
            })
        });
        let msg = rx.blocking_recv().unwrap();
        if let ObserverMessage::Permission { reply, .. } = msg {
            reply
                .send(PermissionResponse {
                    option_id: Some("allow".into()),
                    cancelled: false,
                })
                .unwrap();
        } else {
            panic!("expected Permission message");
        }
        let resp = handle.join().unwrap().unwrap();
        assert_eq!(resp.option_id.as_deref(), Some("allow"));
    }
}
