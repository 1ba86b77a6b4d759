//! Trait ports for every external collaborator named in §6: a thin trait per
//! system, with an optional no-op default where it's marked optional.
//!
//! Grounded on `sipag-core/src/worker/ports.rs` (`GitHubGateway`,
//! `ContainerRuntime`, `StateStore`) — same "one trait per external system"
//! shape, expanded to the six collaborators named here.

use anyhow::Result;

use crate::workitem::WorkItemId;

/// `getPRStatus`/`editPRBase`/`markPRReady`/`getBranchHead` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub merged: bool,
    pub has_unresolved_comments: bool,
    pub state: String,
}

pub trait CodeHostAdapter {
    fn get_pr_status(&self, pr_url: &str) -> Result<PrStatus>;
    fn get_branch_head(&self, branch: &str) -> Result<String>;
    fn edit_pr_base(&self, pr_number: i64, new_base: &str) -> Result<()>;
    fn mark_pr_ready(&self, pr_number: i64) -> Result<()>;
}

/// `spawn({...}) -> {exitCode, durationMs}` (§6).
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub stage_id: String,
    pub stage_file_path: std::path::PathBuf,
    pub skill_name: String,
    pub worktree_path: std::path::PathBuf,
    pub worktree_index: usize,
    pub model: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
}

pub trait SessionExecutor {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome>;
}

/// `sync(repoPath) -> {success, error?}` (§6). One retry on failure per §4.7.
pub trait SyncHook {
    fn sync(&self, repo_path: &std::path::Path) -> Result<()>;
}

/// A row fed into Discovery (§4.4), normally sourced from the SQLite read
/// model that a separate sync step keeps current from the frontmatter files.
#[derive(Debug, Clone)]
pub struct StageRow {
    pub id: WorkItemId,
    pub ticket: WorkItemId,
    pub epic: WorkItemId,
    pub title: String,
    pub status: String,
    pub kanban_column: String,
    pub priority: i64,
    pub due_date: Option<chrono::NaiveDate>,
    pub session_active: bool,
    pub worktree_branch: Option<String>,
    pub refinement_type: Vec<String>,
    pub file_path: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub stage_id: WorkItemId,
    pub depends_on: WorkItemId,
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct TicketRow {
    pub id: WorkItemId,
    pub has_stages: bool,
}

/// The read model Discovery queries (§4.4's "Inputs").
pub trait DiscoverySource {
    fn stage_rows(&self) -> Result<Vec<StageRow>>;
    fn dependency_edges(&self) -> Result<Vec<DependencyEdge>>;
    fn ticket_rows(&self) -> Result<Vec<TicketRow>>;
}

/// The comment-tracking watermark store consulted by the Comment Poller (§4.10).
pub trait CommentStore {
    fn last_seen_count(&self, stage_id: &str) -> Result<i64>;
    fn set_last_seen_count(&self, stage_id: &str, count: i64) -> Result<()>;
}

/// A parent-branch tracking row (§3).
#[derive(Debug, Clone)]
pub struct TrackingRow {
    pub id: String,
    pub child_stage_id: WorkItemId,
    pub parent_stage_id: WorkItemId,
    pub parent_branch: String,
    pub parent_pr_url: Option<String>,
    pub last_known_head: Option<String>,
    pub is_merged: bool,
    pub last_checked: Option<chrono::DateTime<chrono::Utc>>,
}

/// The tracking-row store consulted by the Chain Manager (§4.9). The store
/// itself has no notion of pipeline phases — it's plain row persistence —
/// so "reviewable" filtering (§4.9 "every tracking row whose child stage is
/// in a reviewable phase") is the Chain Manager's job, applied over
/// `all_rows()`.
pub trait TrackingStore {
    fn rows_for_child(&self, child_stage_id: &str) -> Result<Vec<TrackingRow>>;
    fn all_rows(&self) -> Result<Vec<TrackingRow>>;
    fn update_row(&self, row: &TrackingRow) -> Result<()>;
}

/// Lifecycle events a worker's start/exit produces. Optional: the core
/// contract is unchanged if no observer is registered (§9).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Spawned { stage_id: String, worktree_index: usize },
    Exited { stage_id: String, exit_code: i32, status_changed: bool },
}

/// Thin observer of worker lifecycle events (§9 "Registry / WebSocket
/// broadcast"). Default no-op so implementations that don't need one don't
/// have to write a struct for it.
pub trait Observer: Send + Sync {
    fn notify(&self, _event: WorkerEvent) {}
}

/// The observer used when none is configured.
pub struct NullObserver;
impl Observer for NullObserver {}
