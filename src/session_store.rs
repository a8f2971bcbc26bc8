//! Last-session record kept next to the project.
//!
//! The file is informational: it is shown at startup so the user can see
//! which session ran last, but it is never sent back to the agent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_id: String,
    pub last_active: DateTime<Utc>,
}

/// Record `session_id` as the most recent session, stamped with the current time.
pub fn save(path: &Path, session_id: &str) -> Result<()> {
    let record = PersistedSession {
        session_id: session_id.to_string(),
        last_active: Utc::now(),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(&record)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read the last session record. A missing file is `Ok(None)`.
pub fn load(path: &Path) -> Result<Option<PersistedSession>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let record = serde_json::from_str(&content)
        .with_context(|| format!("Malformed session file {}", path.display()))?;
    Ok(Some(record))
}
