pub mod config;
pub mod run;
pub mod sessions;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether", version, about = "Tether: run a tool-using agent against a local model")]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent on a prompt
    Run(RunArgs),
    /// List stored sessions, newest first
    Sessions,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Continue an existing session
    #[arg(long)]
    pub session: Option<String>,

    /// Approve every proposed tool call without asking
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Skill name (defaults to the skill file's name)
    #[arg(long, requires = "skill_file")]
    pub skill: Option<String>,

    /// Markdown file with the skill instructions
    #[arg(long)]
    pub skill_file: Option<PathBuf>,

    /// Prompt text; may be empty when resuming a session
    #[arg(trailing_var_arg = true)]
    pub prompt: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Create a default config file
    Init,
}
