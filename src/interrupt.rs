//! Ctrl+C handling.
//!
//! The first SIGINT only sets a flag: the running turn is cancelled and
//! the run winds down gracefully. A second SIGINT exits immediately with
//! status 130.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::signal::unix::{signal, SignalKind};

/// Global interrupt flag, registered once with SIGINT.
static INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Register the SIGINT handler. Safe to call multiple times (only the first
/// call registers; subsequent calls are no-ops).
pub fn register_signal_handler() -> Result<()> {
    if INTERRUPT_FLAG.get().is_some() {
        return Ok(());
    }
    let flag = INTERRUPT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)));

    // Runs before the flag handler below, so it sees the state left by the
    // previous Ctrl+C.
    let flag_clone = Arc::clone(flag);
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
            if flag_clone.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
        })?;
    }

    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;

    Ok(())
}

/// Check whether the interrupt flag is set.
pub fn is_interrupted() -> bool {
    INTERRUPT_FLAG
        .get()
        .map(|f| f.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Resolves once Ctrl+C has been pressed.
///
/// The SIGINT listener is in place before the flag is checked, so a press
/// between the two is not lost.
pub async fn wait_for_interrupt() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGINT; interrupts disabled");
            return std::future::pending().await;
        }
    };
    while !is_interrupted() {
        if sigint.recv().await.is_none() {
            return std::future::pending().await;
        }
    }
}
