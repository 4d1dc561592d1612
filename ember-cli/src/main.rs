// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Ember CLI
//!
//! Operator tooling for the Ember function agent.

use clap::{Parser, Subcommand};

mod commands;

/// Ember - container lifecycle agent for serverless functions
#[derive(Parser)]
#[command(name = "ember")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "ember.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the agent configuration and print the resolved settings
    Validate {
        /// Print the resolved settings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a per-instance CNI configuration for a subnet slice
    Cni {
        /// Path to the base conflist
        conflist: String,

        /// Requested subnet, e.g. 10.88.1.0/24
        #[arg(short, long)]
        subnet: String,

        /// Write the result to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Show which snapshotter a runtime resolves to
    Snapshotter {
        /// Container runtime, e.g. aws.firecracker
        #[arg(short, long)]
        runtime: String,

        /// Explicit snapshotter override
        #[arg(long = "override")]
        override_snapshotter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Validate { json } => commands::validate::execute(&cli.config, json).await,
        Commands::Cni {
            conflist,
            subnet,
            output,
        } => commands::cni::execute(&conflist, &subnet, output.as_deref()).await,
        Commands::Snapshotter {
            runtime,
            override_snapshotter,
        } => commands::snapshotter::execute(&runtime, override_snapshotter.as_deref()).await,
    }
}
