//! Crate-wide error kinds.
//!
//! Call sites use `anyhow::Result` with `.context(...)`, the way the rest of
//! this workspace already does; `OrchestratorError` exists only for the
//! handful of places (§7 of the design doc) where a caller needs to match on
//! *which* kind of failure happened rather than just log and move on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("stage at {path} is already locked (session_active=true)")]
    AlreadyLocked { path: String },

    #[error("stage at {path} has no string `status` field")]
    MissingStatus { path: String },

    #[error("worktree pool exhausted: all {capacity} slots are in use")]
    PoolExhausted { capacity: usize },

    #[error("attempted to remove untracked worktree path {path}")]
    UntrackedRemoval { path: String },

    #[error("pipeline config error: {0}")]
    Config(String),

    #[error("discovery source read failed: {0}")]
    Discovery(String),

    #[error("session executor error for stage {stage_id}: {message}")]
    Session { stage_id: String, message: String },

    #[error("code host error: {0}")]
    CodeHost(String),

    #[error("sync hook failed: {0}")]
    Sync(String),

    #[error("orchestrator is already running")]
    AlreadyRunning,
}
