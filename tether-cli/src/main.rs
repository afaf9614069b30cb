//! Tether CLI
//!
//! Binary entry point:
//! - `run`: run the agent on a prompt, approving tool calls on the terminal
//! - `sessions`: list stored sessions
//! - `config`: configuration management

mod commands;
mod runtime;
mod tools;

use anyhow::Result;
use clap::Parser;

use tether_core::config::EngineConfig;

use crate::commands::config::run_config_command;
use crate::commands::run::run_prompt;
use crate::commands::sessions::run_sessions_command;
use crate::commands::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries only the final answer.
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(is_tty)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("❌ {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("   caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.config {
        if path.exists() {
            EngineConfig::load_from(path)?
        } else {
            EngineConfig::default()
        }
    } else {
        EngineConfig::load_default()?
    };

    match cli.command {
        Commands::Run(args) => run_prompt(args, config).await,
        Commands::Sessions => run_sessions_command(config).await,
        Commands::Config { action } => run_config_command(action, config, cli.config.as_deref()),
    }
}
