// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use cli::{Cli, Commands, ConfigCommands, SessionCommands};
use mitto_core::{
    AgentCallbacks, AgentConnection, BackgroundSession, ChannelObserver, ConnectError, HookManager, NoopHookManager, ObserverMessage, PlanEntry, PromptMeta, SessionConfig, SessionParams,
    ToolCallStatus,
};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(cli.workspace_dir.as_deref()),
        },
        Commands::Session { command } => match command {
            SessionCommands::Demo { message } => run_session_demo(message).await,
        },
    }
}

fn show_config(workspace_dir: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = mitto_config::load(workspace_dir, None)?;
    println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
    Ok(())
}

/// Stands up one Background Session against an in-process echo connection
/// and a channel-backed observer, prints every delivered event, and exits.
/// Proves the core's wiring end to end without requiring a configured
/// agent binary.
async fn run_session_demo(message: &str) -> anyhow::Result<()> {
    let config = SessionConfig::default();
    let params = SessionParams {
        persisted_id: "demo".to_string(),
        workspace_id: uuid::Uuid::new_v4(),
        working_dir: std::env::current_dir()?.display().to_string(),
        recorder: None,
        queue: None,
        hooks: Arc::new(NoopHookManager) as Arc<dyn HookManager>,
        processors: Vec::new(),
        config,
        is_resumed: false,
        history: Vec::new(),
        plan_cache: None,
    };
    let session = BackgroundSession::new(params, |callbacks| Arc::new(EchoConnection { callbacks }) as Arc<dyn AgentConnection>);
    session.connect(None).await?;

    let (observer, mut rx) = ChannelObserver::new("cli-demo", 64);
    session.add_observer(Arc::new(observer)).await;
    session.prompt(message.to_string(), Vec::new(), PromptMeta::default()).await?;

    while let Some(msg) = rx.recv().await {
        let done = matches!(msg, ObserverMessage::PromptComplete { .. });
        print_observer_message(msg);
        if done {
            break;
        }
    }

    session.close("demo_complete").await;
    Ok(())
}

fn print_observer_message(msg: ObserverMessage) {
    match msg {
        ObserverMessage::AgentMessage { seq, html, .. } => println!("[{seq}] agent: {html}"),
        ObserverMessage::ToolCall { seq, id, title, status } => println!("[{seq}] tool_call {id} ({title}): {status:?}"),
        ObserverMessage::ToolCallUpdate { seq, id, status } => println!("[{seq}] tool_call_update {id}: {status:?}"),
        ObserverMessage::PromptComplete { event_count } => println!("-- done ({event_count} events) --"),
        ObserverMessage::Error { message } => println!("error: {message}"),
        _ => {}
    }
}

/// A bare `AgentConnection` that turns a prompt into a single scripted
/// tool call and an echoed reply, with no child process. Only used by
/// `mitto session demo`; a real deployment supplies a
/// [`mitto_core::ProcessAgentConnection`] wired to a configured ACP
/// server command instead.
struct EchoConnection {
    callbacks: Arc<dyn AgentCallbacks>,
}

#[async_trait]
impl AgentConnection for EchoConnection {
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
        self.callbacks
            .on_plan(Some(vec![PlanEntry {
                content: "echo the prompt back".to_string(),
                status: ToolCallStatus::Running,
            }]))
            .await;
        self.callbacks.on_tool_call("echo-1", "echo", ToolCallStatus::Running).await;
        self.callbacks.on_tool_call_update("echo-1", Some(ToolCallStatus::Completed)).await;
        self.callbacks.on_agent_message(&format!("<p>You said: {message}</p>")).await;
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ConnectError> {
        Ok(())
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
