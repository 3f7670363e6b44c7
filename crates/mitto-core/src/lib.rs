// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The session orchestration core: Background Sessions, their event
//! buffering and observer fan-out, the Queue Dispatcher, the Session
//! Manager, and the Global Broadcaster. This crate owns the lifecycle of
//! one agent conversation end to end; it does not implement any
//! particular wire transport, storage backend, or agent binary itself —
//! those are supplied by a caller through the traits in [`connection`],
//! [`recorder`], and [`store`].

mod broadcaster;
mod buffer;
mod channel_observer;
mod connection;
mod error;
mod event;
mod hooks;
mod manager;
mod observer;
mod queue;
mod recorder;
mod session;
mod store;

pub use broadcaster::{event_type, BroadcastEvent, GlobalBroadcaster, SubscriptionHandle};
pub use buffer::EventBuffer;
pub use channel_observer::{ChannelObserver, ObserverMessage};
pub use connection::{AgentCallbacks, AgentConnection, ConnectError, ProcessAgentConnection};
pub use error::{SessionError, SessionResult};
pub use event::{AppendOutcome, Event, EventData, PermissionOutcome, PermissionRecord, PlanEntry, ToolCallStatus, UserPromptRecord};
pub use hooks::{HookInput, HookManager, HookOutput, NoopHookManager};
pub use manager::{PlanCacheSink, SessionFactory, SessionManager};
pub use observer::{dispatch_event, Observer, ObserverError, ObserverHandle, ObserverSet, PermissionOption, PermissionRequest, PermissionResponse, PromptMeta};
pub use queue::{dispatch_after_completion, idle_delay_elapsed, try_process};
pub use recorder::{MemoryRecorder, Recorder};
pub use session::{BackgroundSession, MessageProcessor, SessionConfig, SessionParams};
pub use store::{MemoryQueue, MemoryStore, Queue, QueuedMessage, SessionMetadata, Store};
