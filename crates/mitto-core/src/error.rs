// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Error taxonomy for the session orchestration core.
///
/// Kinds that affect a single prompt (`Busy`, `Protocol`) never close the
/// session; kinds that mean the session cannot function at all (`Startup`)
/// do. See spec §7 for the authoritative table.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("a prompt is already in progress")]
    Busy,

    #[error("agent connection is not ready")]
    NoConnection,

    #[error("failed to start agent: {0}")]
    Startup(String),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("hook failed: {0}")]
    Hook(String),

    #[error("session capacity exceeded (max {0})")]
    Capacity(usize),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
