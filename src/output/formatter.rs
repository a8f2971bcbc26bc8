//! Terminal output formatting with ANSI colors.
//!
//! Streamed agent text and tool activity are rendered by
//! `acp::streaming`; this module covers run-level messages.

use colored::Colorize;
use std::process::Command;

use crate::acp::fallback::Transition;
use crate::acp::types::{StopReason, TurnOutcome};
use crate::session_store::PersistedSession;

/// Announce a model fallback on stderr.
pub fn print_fallback(transition: &Transition) {
    eprintln!(
        "{} {} {} {}",
        "fallback:".yellow(),
        transition.from.purple(),
        "->".dimmed(),
        transition.to.purple()
    );
    eprintln!("  {}", first_line(&transition.cause).dimmed());
}

/// Print the cause of a fatal error.
pub fn print_fatal(cause: &str) {
    eprintln!("{} {}", "Error:".red().bold(), cause);
}

pub fn print_warning(message: &str) {
    eprintln!("{}", message.yellow());
}

pub fn print_info(message: &str) {
    eprintln!("{}", message.dimmed());
}

/// Show the session recorded by a previous run.
pub fn print_session_resume(previous: &PersistedSession) {
    let when = previous
        .last_active
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S");
    print_info(&format!(
        "previous session {}, last active {}",
        previous.session_id, when
    ));
}

/// One-line summary printed after each turn.
pub fn print_turn_summary(outcome: &TurnOutcome) {
    println!("{}", turn_summary(outcome));
}

fn turn_summary(outcome: &TurnOutcome) -> String {
    let secs = outcome.duration_ms as f64 / 1000.0;
    let mut parts = vec![format!("{secs:.1}s")];
    if !outcome.tool_calls.is_empty() {
        let failed = outcome.tool_calls.iter().filter(|c| c.is_error()).count();
        if failed > 0 {
            parts.push(format!("{} tools ({failed} failed)", outcome.tool_calls.len()));
        } else {
            parts.push(format!("{} tools", outcome.tool_calls.len()));
        }
    }
    if !outcome.files_modified.is_empty() {
        parts.push(format!("modified {}", outcome.files_modified.join(", ")));
    }

    let detail = parts.join(", ");
    match &outcome.stop_reason {
        StopReason::EndTurn => format!("{}", format!("✓ Done ({detail})").green()),
        StopReason::Cancelled => format!("{}", format!("✗ Cancelled ({detail})").yellow()),
        StopReason::Refusal => format!("{}", format!("✗ Refused ({detail})").red()),
        other => format!("{}", format!("✓ Stopped: {other} ({detail})").yellow()),
    }
}

/// Print a separator line across the terminal.
pub fn print_separator() {
    let width = terminal_width();
    println!("{}", "-".repeat(width).dimmed());
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn terminal_width() -> usize {
    Command::new("tput")
        .arg("cols")
        .output()
        .ok()
        .and_then(|out| {
            if out.status.success() {
                String::from_utf8_lossy(&out.stdout).trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(80)
}
