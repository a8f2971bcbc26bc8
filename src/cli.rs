//! CLI argument parsing using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::acp::codec::Framing;

/// Drive an Agent Client Protocol agent from the terminal.
///
/// acprun spawns the agent as a subprocess, runs prompt turns against it,
/// executes the tools it asks for (with consent), and switches to the next
/// model candidate when the current one runs out of quota.
#[derive(Parser, Debug)]
#[command(
    name = "acprun",
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Prompt to send; multiple words are joined with spaces
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,

    /// Read prompts line by line from stdin
    #[arg(short, long)]
    pub interactive: bool,

    /// Agent command to spawn
    #[arg(long, env = "ACPRUN_AGENT")]
    pub agent: Option<String>,

    /// Model candidate, in fallback order (repeatable)
    #[arg(
        long = "model",
        value_name = "MODEL",
        env = "ACPRUN_MODELS",
        value_delimiter = ','
    )]
    pub models: Vec<String>,

    /// Wire framing: newline or content-length
    #[arg(long, value_name = "FRAMING")]
    pub framing: Option<Framing>,

    /// Approve every tool call without asking
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Refuse file writes and destructive permission requests
    #[arg(long)]
    pub read_only: bool,

    /// Working directory for the session
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Debug-level diagnostics
    #[arg(short, long)]
    pub verbose: bool,

    /// Write diagnostics to a timestamped file instead of stderr
    #[arg(long)]
    pub log_file: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Write a commented .acprun.toml in the current directory
    Init,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The one-shot prompt, if any words were given.
    pub fn prompt_text(&self) -> Option<String> {
        let text = self.prompt.join(" ");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
