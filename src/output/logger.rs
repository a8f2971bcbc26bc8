//! Diagnostic logging setup.
//!
//! Diagnostics go through `tracing`; user-facing output does not. The
//! filter comes from `ACPRUN_LOG` (default `warn`, `debug` with
//! `--verbose`). Logs go to stderr unless a log file is requested.

use anyhow::{Context, Result};
use chrono::Utc;
use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ACPRUN_LOG";

/// Install the global subscriber. Returns the log file path when logging to a file.
pub fn init(verbose: bool, log_file: bool) -> Result<Option<PathBuf>> {
    let filter = env_filter(verbose);

    if log_file {
        let path = setup_log_file()?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;
        Ok(Some(path))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;
        Ok(None)
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Set up the log directory and return a fresh timestamped log file path.
pub fn setup_log_file() -> Result<PathBuf> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    Ok(log_dir.join(format!("{}.log", timestamp)))
}

/// Get the log directory path.
pub fn log_directory() -> PathBuf {
    let base_dir = env::var("TMPDIR")
        .or_else(|_| env::var("XDG_RUNTIME_DIR"))
        .unwrap_or_else(|_| "/tmp".to_string());

    let project_name = env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    PathBuf::from(base_dir)
        .join("acprun")
        .join("logs")
        .join(project_name)
}
