//! Chain Manager (§4.9): detects parent-branch merges/HEAD-moves for
//! in-review child stages, fires a rebase follow-up, and retargets/promotes
//! the child's pull request.
//!
//! Grounded on `sipag-core/src/worker/dispatcher.rs`'s fire-and-forget
//! container spawn (detached thread, lock release guaranteed on every path)
//! combined with `sipag-core/src/worker/github_gateway.rs`'s PR-mutation
//! shelling idiom (`edit_pr_base`/`mark_pr_ready` play the role its
//! `merge_pr`/`transition_label` play there).

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::Utc;

use crate::locker;
use crate::ports::{CodeHostAdapter, SessionExecutor, SpawnRequest, TrackingRow, TrackingStore};
use crate::workitem::WorkItemId;

/// What happened to a single tracking row on one scan (for tests/logging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ParentMerged,
    ParentHeadMoved,
    FirstObservation,
    NoChange,
}

/// Outcome of processing one tracking row (§4.9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub event: ChainEvent,
    pub rebase_spawned: bool,
    pub rebase_skip_reason: Option<String>,
    pub retargeted: bool,
    pub promoted_to_ready: bool,
}

/// Dependencies the chain manager needs. `session_executor` is optional: if
/// unconfigured, the rebase spawn step is skipped and the raw event is
/// still recorded (§4.9 "if spawn dependencies are unconfigured, emit the
/// raw event and stop"). It's `Arc`-held rather than borrowed because a
/// successful spawn hands it to a detached thread that may outlive this
/// `ChainManager` and the `scan()` call that constructed it.
pub struct ChainManager<'a> {
    pub tracking_store: &'a dyn TrackingStore,
    pub code_host: &'a dyn CodeHostAdapter,
    pub session_executor: Option<Arc<dyn SessionExecutor + Send + Sync>>,
    pub default_base_branch: &'a str,
    /// Resolve a stage id to its frontmatter file path, or `None` if unknown.
    pub resolve_stage_path: &'a dyn Fn(&WorkItemId) -> Option<PathBuf>,
    /// Load a stage's `rebase_conflict` flag without going through the full
    /// `workitem::Stage` parse (used for the precondition check).
    pub rebase_conflict_flag: &'a dyn Fn(&WorkItemId) -> bool,
    /// Resolve a child stage's PR number, if known.
    pub child_pr_number: &'a dyn Fn(&WorkItemId) -> Option<i64>,
    /// Whether a child stage's current status counts as "a reviewable
    /// phase" (§4.9) — an open PR awaiting parent merges. `scan()` filters
    /// tracking rows to these children before processing any of them.
    pub is_reviewable: &'a dyn Fn(&WorkItemId) -> bool,
}

impl<'a> ChainManager<'a> {
    /// Scan every tracking row whose child stage is in a reviewable phase
    /// and process it independently — one row's failure never halts the
    /// scan (§4.9).
    pub fn scan(&self) -> Vec<RowOutcome> {
        let rows = match self.tracking_store.all_rows() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "chain manager: failed to read tracking rows");
                return Vec::new();
            }
        };

        rows.iter()
            .filter(|row| (self.is_reviewable)(&row.child_stage_id))
            .map(|row| self.process_row(row))
            .collect()
    }

    fn process_row(&self, row: &TrackingRow) -> RowOutcome {
        let mut row = row.clone();
        let event = self.detect_event(&mut row);

        if let Err(e) = self.tracking_store.update_row(&row) {
            tracing::error!(row = %row.id, error = %e, "chain manager: failed to persist tracking row");
        }

        match event {
            ChainEvent::ParentMerged | ChainEvent::ParentHeadMoved => {
                let (rebase_spawned, rebase_skip_reason) = self.try_spawn_rebase(&row.child_stage_id);
                let (retargeted, promoted_to_ready) = if event == ChainEvent::ParentMerged {
                    self.run_retarget_matrix(&row.child_stage_id)
                } else {
                    (false, false)
                };
                RowOutcome {
                    event,
                    rebase_spawned,
                    rebase_skip_reason,
                    retargeted,
                    promoted_to_ready,
                }
            }
            ChainEvent::FirstObservation | ChainEvent::NoChange => RowOutcome {
                event,
                rebase_spawned: false,
                rebase_skip_reason: None,
                retargeted: false,
                promoted_to_ready: false,
            },
        }
    }

    /// Steps 1-4 of §4.9: merge check, then HEAD-move check, then seed, then
    /// no-op. `last_checked` only advances on an actionable event (I6).
    fn detect_event(&self, row: &mut TrackingRow) -> ChainEvent {
        if !row.is_merged {
            let merged = row
                .parent_pr_url
                .as_deref()
                .and_then(|url| self.code_host.get_pr_status(url).ok())
                .map(|s| s.merged)
                .unwrap_or(false);
            if merged {
                row.is_merged = true;
                row.last_checked = Some(Utc::now());
                return ChainEvent::ParentMerged;
            }
        } else {
            return ChainEvent::NoChange;
        }

        let current_head = self.code_host.get_branch_head(&row.parent_branch).ok();
        match (&row.last_known_head, &current_head) {
            (Some(last), Some(current)) if last != current => {
                row.last_known_head = current_head;
                row.last_checked = Some(Utc::now());
                ChainEvent::ParentHeadMoved
            }
            (None, Some(_)) => {
                row.last_known_head = current_head;
                ChainEvent::FirstObservation
            }
            _ => ChainEvent::NoChange,
        }
    }

    /// Fire-and-forget rebase spawn with lock released on every path (§4.9).
    /// The session itself runs on a detached thread so a slow or long-lived
    /// rebase session never blocks the chain manager's polling job; the
    /// lock taken below is released only when that thread finishes, on its
    /// success, failure, or panic path alike, never back here.
    fn try_spawn_rebase(&self, child_stage_id: &WorkItemId) -> (bool, Option<String>) {
        let Some(executor) = self.session_executor.clone() else {
            return (false, None);
        };

        let Some(path) = (self.resolve_stage_path)(child_stage_id) else {
            return (false, Some("skipped_no_file".to_string()));
        };

        if (self.rebase_conflict_flag)(child_stage_id) {
            return (false, Some("skipped_conflict".to_string()));
        }

        match locker::is_locked(&path) {
            Ok(true) => return (false, Some("skipped_locked".to_string())),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(stage = %child_stage_id, error = %e, "chain manager: failed to check lock");
                return (false, Some("skipped_lock_error".to_string()));
            }
        }

        if let Err(e) = locker::acquire_lock(&path) {
            tracing::warn!(stage = %child_stage_id, error = %e, "chain manager: failed to acquire lock for rebase");
            return (false, Some("skipped_locked".to_string()));
        }

        let request = SpawnRequest {
            stage_id: child_stage_id.as_str().to_string(),
            stage_file_path: path.clone(),
            skill_name: "rebase-child-mr".to_string(),
            worktree_path: PathBuf::new(),
            worktree_index: 0,
            model: None,
            env: Vec::new(),
        };

        let path_for_release = path.clone();
        let stage_for_log = child_stage_id.clone();
        spawn_detached(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                executor.spawn(request)
            }));
            match result {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        stage = %stage_for_log,
                        exit_code = outcome.exit_code,
                        "chain manager: rebase session completed"
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!(stage = %stage_for_log, error = %e, "chain manager: rebase session failed");
                }
                Err(panic) => {
                    tracing::error!(stage = %stage_for_log, panic = ?panic, "chain manager: rebase session panicked");
                }
            }
            // Released here, on the session's own completion, regardless of
            // outcome — this is the only release for a lock acquired above.
            let _ = locker::release_lock(&path_for_release);
        });

        (true, None)
    }

    /// The retarget matrix (§4.9, P8): partition this child's tracking rows
    /// by `is_merged` and act on the count remaining unmerged.
    fn run_retarget_matrix(&self, child_stage_id: &WorkItemId) -> (bool, bool) {
        let Some(pr_number) = (self.child_pr_number)(child_stage_id) else {
            return (false, false);
        };

        let rows = match self.tracking_store.rows_for_child(child_stage_id.as_str()) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(stage = %child_stage_id, error = %e, "chain manager: failed to read rows for retarget");
                return (false, false);
            }
        };

        let unmerged: Vec<&TrackingRow> = rows.iter().filter(|r| !r.is_merged).collect();

        match unmerged.len() {
            n if n > 1 => (false, false),
            1 => {
                let target = &unmerged[0].parent_branch;
                match self.code_host.edit_pr_base(pr_number, target) {
                    Ok(()) => (true, false),
                    Err(e) => {
                        tracing::error!(stage = %child_stage_id, error = %e, "chain manager: retarget to remaining parent failed");
                        (false, false)
                    }
                }
            }
            _ => {
                if let Err(e) = self.code_host.edit_pr_base(pr_number, self.default_base_branch) {
                    tracing::error!(stage = %child_stage_id, error = %e, "chain manager: retarget to default branch failed");
                    return (false, false);
                }
                if let Err(e) = self.code_host.mark_pr_ready(pr_number) {
                    tracing::error!(stage = %child_stage_id, error = %e, "chain manager: mark-ready failed, skipping frontmatter rewrite");
                    return (true, false);
                }
                if let Some(path) = (self.resolve_stage_path)(child_stage_id) {
                    if let Err(e) = clear_pending_parents(&path) {
                        tracing::error!(stage = %child_stage_id, error = %e, "chain manager: failed to rewrite child frontmatter after promotion");
                    }
                }
                (true, true)
            }
        }
    }
}

fn clear_pending_parents(path: &std::path::Path) -> anyhow::Result<()> {
    let mut doc = crate::frontmatter::read(path)?;
    doc.data.insert("is_draft", crate::frontmatter::Value::from(false));
    doc.data
        .insert("pending_merge_parents", crate::frontmatter::Value::List(vec![]));
    crate::frontmatter::write(path, &doc.data, &doc.body)
}

/// Spawn a closure on a detached thread so the chain manager's polling job
/// is never blocked by it (§4.9 "fire-and-forget"). `try_spawn_rebase` uses
/// this for the rebase session itself, with the lock release folded into
/// the closure so it fires exactly once, on the thread's own completion.
fn spawn_detached<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f);
}
