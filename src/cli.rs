// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mitto",
    about = "Session orchestration core for a multi-client AI-agent proxy",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the workspace directory used for `.mittorc` discovery
    /// (defaults to the current directory).
    #[arg(long, short = 'w', global = true)]
    pub workspace_dir: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Session orchestration demos, for proving the core is wired up.
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective, merged configuration and exit.
    Show,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Run a single scripted prompt through a Background Session backed
    /// by an in-process mock Agent Connection, printing the delivered
    /// events. Useful for verifying the wiring without a real agent
    /// binary configured.
    Demo {
        /// The message to prompt with.
        #[arg(default_value = "Say hello")]
        message: String,
    },
}
