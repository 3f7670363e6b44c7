// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-prompt hook application. See spec §3 "HookManager" and §4.4.
//!
//! A hook can rewrite the outgoing message or attach files before it ever
//! reaches the agent connection; a failing hook is reported as a
//! [`crate::error::SessionError::Hook`] rather than silently swallowed, so
//! callers can route it to the recorder's `RecordError` and to observers'
//! `on_error`.

use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct HookInput {
    pub message: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    pub message: String,
    pub attachments: Vec<String>,
}

#[async_trait]
pub trait HookManager: Send + Sync {
    /// Names of the hooks that would run, in application order.
    fn hooks(&self) -> Vec<String>;

    async fn apply(&self, input: HookInput) -> anyhow::Result<HookOutput>;
}

/// The default: no hooks configured, message passed through unchanged.
#[derive(Default)]
pub struct NoopHookManager;

#[async_trait]
impl HookManager for NoopHookManager {
    fn hooks(&self) -> Vec<String> {
        Vec::new()
    }

    async fn apply(&self, input: HookInput) -> anyhow::Result<HookOutput> {
        Ok(HookOutput {
            message: input.message,
            attachments: input.image_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_passes_message_through() {
        let hooks = NoopHookManager;
        assert!(hooks.hooks().is_empty());
        let out = hooks
            .apply(HookInput {
                message: "hello".into(),
                image_ids: vec!["img1".into()],
            })
            .await
            .unwrap();
        assert_eq!(out.message, "hello");
        assert_eq!(out.attachments, vec!["img1".to_string()]);
    }
}
