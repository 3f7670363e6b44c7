// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Queue Dispatcher: FIFO delivery of deferred prompts with idle-delay
//! gating. See spec §4.5.
//!
//! The pure idle-gating predicate lives here so it is testable without a
//! full [`BackgroundSession`]; the orchestration (pop → notify → delay →
//! prompt → notify) is a method on the session itself since it needs the
//! session's observers, config, and connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::observer::PromptMeta;
use crate::session::BackgroundSession;

/// Whether the idle-delay configured for a session's queue has elapsed
/// since its last response completed. A session that has never completed
/// a response (`last_response_complete` is `None`) is treated as
/// immediately eligible, matching spec §4.5's "or `lastResponseComplete`
/// is zero".
pub fn idle_delay_elapsed(last_response_complete: Option<DateTime<Utc>>, delay_seconds: u64, now: DateTime<Utc>) -> bool {
    match last_response_complete {
        None => true,
        Some(t) => now.signed_duration_since(t) >= chrono::Duration::seconds(delay_seconds as i64),
    }
}

/// Runs once, immediately after a prompt completes. Per spec §4.5:
/// disabled → stop; empty queue → stop; otherwise announce, delay, send,
/// announce again.
pub async fn dispatch_after_completion(session: &Arc<BackgroundSession>) {
    if !session.queue_enabled() {
        return;
    }
    let Some(queue) = session.queue() else { return };

    let queued = match queue.pop().await {
        Ok(Some(q)) => q,
        Ok(None) => return,
        Err(e) => {
            warn!(session_id = %session.session_id(), error = %e, "failed to pop queue");
            return;
        }
    };

    session.notify_queue_message_sending(&queued.id);

    let delay = session.queue_delay_seconds();
    if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    }

    let meta = PromptMeta {
        sender: Some("queue".to_string()),
        prompt_id: Some(queued.id.clone()),
    };
    if let Err(e) = session.prompt(queued.message, queued.image_ids, meta).await {
        warn!(session_id = %session.session_id(), queued_id = %queued.id, error = %e, "queued prompt failed to dispatch");
        return;
    }

    session.notify_queue_message_sent(&queued.id);
    let remaining = queue.len().await.unwrap_or(0);
    session.notify_queue_updated(remaining, "removed", &queued.id);
}

/// Try-process entry point: used on startup recovery and by a periodic
/// idle checker. Returns whether a send occurred.
pub async fn try_process(session: &Arc<BackgroundSession>) -> bool {
    if !session.queue_enabled() || session.is_closed() || session.is_prompting().await {
        return false;
    }
    let Some(queue) = session.queue() else { return false };
    let len = queue.len().await.unwrap_or(0);
    if len == 0 {
        return false;
    }
    let last = session.last_response_complete().await;
    if !idle_delay_elapsed(last, session.queue_delay_seconds(), Utc::now()) {
        debug!(session_id = %session.session_id(), "queue idle delay has not elapsed yet");
        return false;
    }

    let queued = match queue.pop().await {
        Ok(Some(q)) => q,
        Ok(None) => return false,
        Err(_) => return false,
    };
    session.notify_queue_message_sending(&queued.id);
    let meta = PromptMeta {
        sender: Some("queue".to_string()),
        prompt_id: Some(queued.id.clone()),
    };
    if session.prompt(queued.message, queued.image_ids, meta).await.is_err() {
        return false;
    }
    session.notify_queue_message_sent(&queued.id);
    let remaining = queue.len().await.unwrap_or(0);
    session.notify_queue_updated(remaining, "removed", &queued.id);
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
