//! Error taxonomy for the ACP engine.
//!
//! Every failure the engine can surface maps onto one `AcpError` variant.
//! Propagation rules:
//! - `Protocol` never escapes the decode boundary; the codec logs and drops it.
//! - `Quota` is absorbed by model fallback until candidates run out, at which
//!   point it becomes `QuotaExhausted`.
//! - `ToolExecution` is reported back to the agent as a tool error and the
//!   session continues.
//! - `Transport` and `Auth` are fatal for the session that produced them.

use thiserror::Error;

use crate::acp::fallback;
use crate::acp::message::RpcError;

#[derive(Error, Debug)]
pub enum AcpError {
    /// Process or stream failure. Fails every pending call on that transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or JSON payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Rate-limit / quota class failure, classified from error text.
    #[error("quota error: {0}")]
    Quota(String),

    /// Quota failure with no fallback candidate left.
    #[error("all model candidates exhausted (tried: {tried}); last error: {last_error}")]
    QuotaExhausted { tried: String, last_error: String },

    /// Non-quota authentication failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A tool capability could not be invoked or failed while running.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// The agent answered a call with a JSON-RPC error object.
    #[error("agent returned an error for '{method}': {error}")]
    Rpc { method: String, error: RpcError },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using `AcpError`.
pub type Result<T> = std::result::Result<T, AcpError>;

impl AcpError {
    /// Whether this error should trigger a model fallback.
    ///
    /// `Transport` errors are included because an agent that dies on a rate
    /// limit usually says so on stderr, and the stderr tail is part of the
    /// transport error text.
    pub fn is_quota(&self) -> bool {
        match self {
            AcpError::Quota(_) => true,
            AcpError::Transport(_) | AcpError::Rpc { .. } => {
                fallback::is_quota_error(&self.to_string())
            }
            _ => false,
        }
    }

    /// Re-tag a quota-class error as `Quota`, leaving everything else alone.
    pub fn into_quota_if_classified(self) -> Self {
        if matches!(self, AcpError::Quota(_)) || !self.is_quota() {
            return self;
        }
        AcpError::Quota(self.to_string())
    }
}
