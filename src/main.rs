//! acprun - Agent Client Protocol runner with quota-aware model fallback

use anyhow::{Context, Result};
use std::process::ExitCode;
use tokio::task::LocalSet;

use acprun::output::{formatter, logger};
use acprun::run_loop::Outcome;
use acprun::{cli, config, project, run_loop};

fn main() -> ExitCode {
    match run() {
        Ok(result) => result,
        Err(e) => {
            formatter::print_fatal(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = cli::Args::parse_args();

    if let Some(cli::Command::Init) = args.command {
        project::init()?;
        return Ok(ExitCode::SUCCESS);
    }

    let project = project::discover()?;
    let config = config::Config::from_args(&args, project)?;

    if let Some(path) = logger::init(config.verbose, config.log_file)? {
        formatter::print_info(&format!("Log will be written to: {}", path.display()));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let local = LocalSet::new();

    match local.block_on(&runtime, run_loop::run(config))? {
        Outcome::Complete | Outcome::Interrupted => Ok(ExitCode::SUCCESS),
        Outcome::Failed(status) => Ok(ExitCode::from(exit_status(status))),
    }
}

/// The agent's exit status when it fits, otherwise 1.
fn exit_status(status: i32) -> u8 {
    u8::try_from(status)
        .ok()
        .filter(|code| *code != 0)
        .unwrap_or(1)
}
