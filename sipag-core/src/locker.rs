//! Per-file exclusive lock realised as a `session_active` frontmatter flag.
//!
//! Grounded on `sipag-core/src/worker/lock.rs`'s `WorkerLock` — same
//! fail-fast, no-spin-retry posture — adapted from a process-wide PID file
//! to a per-stage-file frontmatter flag, since this locks individual stages
//! rather than an entire repo.
//!
//! Advisory only: two orchestrator instances against the same repo are not
//! supported (§4.2, §9 open question "cross-host locking").

use std::path::Path;

use anyhow::Result;

use crate::error::OrchestratorError;
use crate::frontmatter::{self, Value};

/// `acquireLock(path)`: fails with `AlreadyLocked` if `session_active` is
/// already `true`, otherwise stamps it `true`.
pub fn acquire_lock(path: &Path) -> Result<()> {
    let mut doc = frontmatter::read(path)?;
    if doc.data.get_bool("session_active") {
        return Err(OrchestratorError::AlreadyLocked {
            path: path.display().to_string(),
        }
        .into());
    }
    doc.data.insert("session_active", Value::from(true));
    frontmatter::write(path, &doc.data, &doc.body)?;
    tracing::info!(path = %path.display(), "lock acquired");
    Ok(())
}

/// `releaseLock(path)`: stamps `session_active` `false` unconditionally.
pub fn release_lock(path: &Path) -> Result<()> {
    let mut doc = frontmatter::read(path)?;
    doc.data.insert("session_active", Value::from(false));
    frontmatter::write(path, &doc.data, &doc.body)?;
    tracing::info!(path = %path.display(), "lock released");
    Ok(())
}

/// `isLocked(path)`: a plain read, no mutation.
pub fn is_locked(path: &Path) -> Result<bool> {
    let doc = frontmatter::read(path)?;
    Ok(doc.data.get_bool("session_active"))
}

/// `readStatus(path)`: returns the string `status` field.
///
/// Fails with `MissingStatus` if absent or non-string.
pub fn read_status(path: &Path) -> Result<String> {
    let doc = frontmatter::read(path)?;
    doc.data
        .get_str("status")
        .map(|s| s.to_string())
        .ok_or_else(|| {
            OrchestratorError::MissingStatus {
                path: path.display().to_string(),
            }
            .into()
        })
}
