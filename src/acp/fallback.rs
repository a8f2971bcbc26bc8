//! Model fallback: quota classification and the candidate cursor.
//!
//! Agents report rate limits in wildly different shapes (HTTP status in the
//! message, gRPC status names, stderr noise before exit, or simply an empty
//! turn), so classification works on the rendered error text rather than on
//! a typed code.

use crate::acp::error::{AcpError, Result};

/// Lower-cased markers that identify a quota-class failure.
const QUOTA_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "rate-limit",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "too many requests",
    "empty response",
    "internal error",
    "overloaded",
];

/// Whether `text` describes a quota / rate-limit class failure.
pub fn is_quota_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lower.contains(marker)) || contains_status_429(&lower)
}

/// Matches `429` as a standalone number, so `14290` or `ids 4291` don't count.
fn contains_status_429(text: &str) -> bool {
    let bytes = text.as_bytes();
    text.match_indices("429").any(|(start, _)| {
        let end = start + 3;
        let before = start == 0 || !bytes[start - 1].is_ascii_digit();
        let after = end == bytes.len() || !bytes[end].is_ascii_digit();
        before && after
    })
}

/// Ordered model identifiers with a forward-only cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCandidateList {
    candidates: Vec<String>,
    index: usize,
}

impl ModelCandidateList {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates,
            index: 0,
        }
    }

    /// The active model, or `None` when the list is empty or exhausted.
    pub fn current(&self) -> Option<&str> {
        self.candidates.get(self.index).map(String::as_str)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.candidates.len()
    }

    /// Models tried so far, including the current one.
    pub fn tried(&self) -> &[String] {
        let end = (self.index + 1).min(self.candidates.len());
        &self.candidates[..end]
    }

    /// Step to the next candidate. Returns it, or `None` once past the end.
    /// The index never moves backwards and never wraps.
    fn advance(&mut self) -> Option<&str> {
        if self.index < self.candidates.len() {
            self.index += 1;
        }
        self.current()
    }
}

/// A recorded model switch, for display and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub cause: String,
}

/// Owns the candidate list for the whole process run.
#[derive(Debug)]
pub struct ModelFallbackManager {
    models: ModelCandidateList,
    transitions: Vec<Transition>,
}

impl ModelFallbackManager {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            models: ModelCandidateList::new(candidates),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.models.current()
    }

    pub fn models(&self) -> &ModelCandidateList {
        &self.models
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Move past the current model after a quota failure.
    ///
    /// Fails with `QuotaExhausted` when no candidate is left; the cursor then
    /// stays exhausted for the rest of the run.
    pub fn advance(&mut self, cause: &AcpError) -> Result<Transition> {
        let from = self.models.current().unwrap_or_default().to_string();
        let tried = self.models.tried().join(", ");

        match self.models.advance() {
            Some(next) => {
                let transition = Transition {
                    from,
                    to: next.to_string(),
                    cause: cause.to_string(),
                };
                tracing::debug!(
                    from = %transition.from,
                    to = %transition.to,
                    "falling back to next model candidate"
                );
                self.transitions.push(transition.clone());
                Ok(transition)
            }
            None => Err(AcpError::QuotaExhausted {
                tried,
                last_error: cause.to_string(),
            }),
        }
    }
}
