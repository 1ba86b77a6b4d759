//! The Orchestration Loop (§4.11-§4.12): resolver sweep, discovery,
//! admission, spawn, exit handling, idempotent start/stop.
//!
//! Grounded on `sipag-core/src/worker/loop_runner.rs`'s `WorkerLoop`
//! (`LoopState` enum, `run()` method, drain-signal check each cycle,
//! startup banner) — the direct ancestor of this module's top-level driver.
//! `DrainSignal` (`worker/drain.rs`) is kept as the shutdown mechanism's
//! in-process analogue: an `AtomicBool` + `Condvar` instead of a sentinel
//! file, since this core is a library invoked in-process rather than a CLI
//! polling a file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::chain::ChainManager;
use crate::comments;
use crate::discovery::{self, ReadyStage};
use crate::error::OrchestratorError;
use crate::exit_gate;
use crate::locker;
use crate::pipeline::PipelineConfig;
use crate::ports::{
    CodeHostAdapter, CommentStore, DiscoverySource, NullObserver, Observer, SessionExecutor,
    SpawnRequest, SyncHook, TrackingStore, WorkerEvent,
};
use crate::resolver::{self, ResolverContext};
use crate::workitem::{self, WorkItemId};
use crate::worktree::WorktreePool;

/// Lifecycle state of the orchestration loop (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Ticking,
    Admitting,
    Spawning,
    Waiting,
    Stopping,
    Terminated,
}

/// An active worker's bookkeeping (§3 "Worker record").
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub stage_id: WorkItemId,
    pub stage_file_path: PathBuf,
    pub worktree_path: PathBuf,
    pub worktree_index: usize,
    pub status_before: String,
    pub start_time: Instant,
}

/// Construction-time configuration.
pub struct OrchestratorConfig {
    pub repo_root: PathBuf,
    pub max_parallel: usize,
    pub idle: Duration,
}

struct Shared {
    config: OrchestratorConfig,
    pipeline: PipelineConfig,
    worktree_pool: Mutex<WorktreePool>,
    active: Mutex<HashMap<usize, WorkerRecord>>,
    cond: Condvar,
    running: AtomicBool,
    stopping: AtomicBool,
    state: Mutex<LoopState>,

    discovery_source: Box<dyn DiscoverySource + Send + Sync>,
    code_host: Box<dyn CodeHostAdapter + Send + Sync>,
    session_executor: Arc<dyn SessionExecutor + Send + Sync>,
    sync_hook: Box<dyn SyncHook + Send + Sync>,
    tracking_store: Box<dyn TrackingStore + Send + Sync>,
    comment_store: Box<dyn CommentStore + Send + Sync>,
    observer: Box<dyn Observer>,
    id_to_path: Box<dyn Fn(&WorkItemId) -> Option<PathBuf> + Send + Sync>,
    stage_statuses_by_resolver_phase: Box<dyn Fn(&str) -> Vec<(WorkItemId, PathBuf)> + Send + Sync>,
}

/// The top-level orchestrator. Cheap to clone: all state lives behind `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

#[allow(clippy::too_many_arguments)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    pipeline: PipelineConfig,
    discovery_source: Box<dyn DiscoverySource + Send + Sync>,
    code_host: Box<dyn CodeHostAdapter + Send + Sync>,
    session_executor: Arc<dyn SessionExecutor + Send + Sync>,
    sync_hook: Box<dyn SyncHook + Send + Sync>,
    tracking_store: Box<dyn TrackingStore + Send + Sync>,
    comment_store: Box<dyn CommentStore + Send + Sync>,
    observer: Box<dyn Observer>,
    id_to_path: Box<dyn Fn(&WorkItemId) -> Option<PathBuf> + Send + Sync>,
    stage_statuses_by_resolver_phase: Box<dyn Fn(&str) -> Vec<(WorkItemId, PathBuf)> + Send + Sync>,
}

impl OrchestratorBuilder {
    pub fn new(
        config: OrchestratorConfig,
        pipeline: PipelineConfig,
        discovery_source: Box<dyn DiscoverySource + Send + Sync>,
        code_host: Box<dyn CodeHostAdapter + Send + Sync>,
        session_executor: Arc<dyn SessionExecutor + Send + Sync>,
        sync_hook: Box<dyn SyncHook + Send + Sync>,
        tracking_store: Box<dyn TrackingStore + Send + Sync>,
        comment_store: Box<dyn CommentStore + Send + Sync>,
        id_to_path: Box<dyn Fn(&WorkItemId) -> Option<PathBuf> + Send + Sync>,
        stage_statuses_by_resolver_phase: Box<dyn Fn(&str) -> Vec<(WorkItemId, PathBuf)> + Send + Sync>,
    ) -> Self {
        Self {
            config,
            pipeline,
            discovery_source,
            code_host,
            session_executor,
            sync_hook,
            tracking_store,
            comment_store,
            observer: Box::new(NullObserver),
            id_to_path,
            stage_statuses_by_resolver_phase,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Orchestrator {
        let worktree_pool = WorktreePool::new(self.config.repo_root.clone(), self.config.max_parallel);
        Orchestrator {
            shared: Arc::new(Shared {
                config: self.config,
                pipeline: self.pipeline,
                worktree_pool: Mutex::new(worktree_pool),
                active: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                state: Mutex::new(LoopState::Idle),
                discovery_source: self.discovery_source,
                code_host: self.code_host,
                session_executor: self.session_executor,
                sync_hook: self.sync_hook,
                tracking_store: self.tracking_store,
                comment_store: self.comment_store,
                observer: self.observer,
                id_to_path: self.id_to_path,
                stage_statuses_by_resolver_phase: self.stage_statuses_by_resolver_phase,
            }),
        }
    }
}

impl Orchestrator {
    pub fn state(&self) -> LoopState {
        *self.shared.state.lock().unwrap()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().unwrap().len()
    }

    fn set_state(&self, s: LoopState) {
        *self.shared.state.lock().unwrap() = s;
    }

    /// `start()` throws if already running (§5).
    pub fn start(&self, once: bool) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning.into());
        }
        self.shared.stopping.store(false, Ordering::SeqCst);

        let mut isolation_checked = false;

        loop {
            if self.shared.stopping.load(Ordering::SeqCst) {
                break;
            }

            self.set_state(LoopState::Ticking);
            self.resolver_sweep();

            let slots = self
                .shared
                .config
                .max_parallel
                .saturating_sub(self.active_count());

            if slots == 0 {
                self.set_state(LoopState::Waiting);
                self.wait_for_slot_or_stop(None);
                continue;
            }

            self.set_state(LoopState::Admitting);
            let result = match discovery::discover(
                self.shared.discovery_source.as_ref(),
                &self.shared.pipeline,
                slots,
            ) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "discovery read failed, retrying next tick");
                    self.wait_for_slot_or_stop(Some(self.shared.config.idle));
                    continue;
                }
            };

            self.set_state(LoopState::Spawning);
            let mut spawned = 0usize;
            for candidate in result.ready {
                match self.try_admit(candidate, &mut isolation_checked) {
                    Ok(true) => spawned += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, "admission error, skipping candidate"),
                }
            }

            if once {
                if spawned > 0 {
                    self.drain_all();
                }
                break;
            }

            if spawned == 0 && self.active_count() == 0 {
                self.set_state(LoopState::Waiting);
                self.wait_for_slot_or_stop(Some(self.shared.config.idle));
            }
        }

        self.set_state(LoopState::Terminated);
        self.shared.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Idempotent shutdown (§5). Does not kill in-flight workers; cleanup
    /// runs on their natural exit.
    pub fn stop(&self) {
        self.set_state(LoopState::Stopping);
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _guard = self.shared.active.lock().unwrap();
        self.shared.cond.notify_all();
    }

    /// Waits for a free admission slot (`timeout: None`) or for an idle
    /// period to elapse (`timeout: Some(d)`), whichever is cancelled first
    /// by `stop()` or, for the slot wait, by a worker exit.
    ///
    /// The slot wait re-checks `active.len() < max_parallel` under the same
    /// lock in a loop rather than trusting a single `wait()` to return with
    /// the predicate already true: if the sole active worker (e.g.
    /// `max_parallel == 1`) exits and calls `notify_all` in the window
    /// between this function's caller reading `active_count()` and this
    /// function's `cond.wait` actually registering, that notification would
    /// otherwise be lost and the loop would block forever.
    fn wait_for_slot_or_stop(&self, timeout: Option<Duration>) {
        let mut guard = self.shared.active.lock().unwrap();
        match timeout {
            None => {
                while !self.shared.stopping.load(Ordering::SeqCst)
                    && guard.len() >= self.shared.config.max_parallel
                {
                    guard = self.shared.cond.wait(guard).unwrap();
                }
            }
            Some(d) => {
                if self.shared.stopping.load(Ordering::SeqCst) {
                    return;
                }
                let _ = self.shared.cond.wait_timeout(guard, d);
            }
        }
    }

    fn drain_all(&self) {
        loop {
            let guard = self.shared.active.lock().unwrap();
            if guard.is_empty() {
                return;
            }
            let _ = self.shared.cond.wait(guard);
        }
    }

    /// §4.6: run every configured resolver phase over every stage parked in
    /// its status.
    fn resolver_sweep(&self) {
        let ctx = ResolverContext {
            code_host: Some(self.shared.code_host.as_ref()),
        };
        for phase in &self.shared.pipeline.phases {
            let Some(resolver_name) = phase.resolver_name() else {
                continue;
            };
            for (stage_id, path) in (self.shared.stage_statuses_by_resolver_phase)(&phase.status) {
                let stage = match workitem::read_stage(&path) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(stage = %stage_id, error = %e, "resolver sweep: failed to read stage");
                        continue;
                    }
                };
                if let Some(new_status) = resolver::run_resolver(resolver_name, &stage, &ctx) {
                    if let Err(e) = write_status(&path, &new_status) {
                        tracing::error!(stage = %stage_id, error = %e, "resolver sweep: failed to write new status");
                        continue;
                    }
                    if let Err(e) = exit_gate::run(
                        &stage_id,
                        &new_status,
                        &self.shared.config.repo_root,
                        self.shared.id_to_path.as_ref(),
                        self.shared.sync_hook.as_ref(),
                    ) {
                        tracing::error!(stage = %stage_id, error = %e, "resolver sweep: exit gate failed");
                    }
                }
            }
        }
    }

    /// Steps 4a-4f of §4.11, for a single candidate.
    fn try_admit(&self, candidate: ReadyStage, isolation_checked: &mut bool) -> Result<bool> {
        let path = candidate.row.file_path.clone();
        let stage_id = candidate.row.id.clone();

        if let Err(e) = locker::acquire_lock(&path) {
            tracing::debug!(stage = %stage_id, error = %e, "admission: lock contended, skipping");
            return Ok(false);
        }

        let mut status_before = locker::read_status(&path)?;
        if status_before == workitem::STATUS_NOT_STARTED {
            let entry_status = self.shared.pipeline.entry_phase().status.clone();
            write_status(&path, &entry_status)?;
            status_before = entry_status;
        }

        let Some(skill_name) = self.shared.pipeline.lookup_skill(&status_before) else {
            // Either unconfigured or a resolver phase not yet transitioned;
            // the next resolver sweep will handle it (§4.11 step 4c).
            let _ = locker::release_lock(&path);
            return Ok(false);
        };
        let skill_name = skill_name.to_string();

        if !*isolation_checked {
            let mut pool = self.shared.worktree_pool.lock().unwrap();
            if let Err(e) = pool.validate_isolation_strategy() {
                tracing::error!(error = %e, "admission: isolation strategy invalid, skipping candidate");
                drop(pool);
                let _ = locker::release_lock(&path);
                return Ok(false);
            }
            *isolation_checked = true;
        }

        let branch = candidate
            .row
            .worktree_branch
            .clone()
            .unwrap_or_else(|| format!("sipag/{}", stage_id.as_str().to_lowercase()));

        let worktree = {
            let mut pool = self.shared.worktree_pool.lock().unwrap();
            match pool.create(&branch) {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!(stage = %stage_id, error = %e, "admission: worktree create failed");
                    drop(pool);
                    let _ = locker::release_lock(&path);
                    return Ok(false);
                }
            }
        };

        let record = WorkerRecord {
            stage_id: stage_id.clone(),
            stage_file_path: path.clone(),
            worktree_path: worktree.path.clone(),
            worktree_index: worktree.index,
            status_before: status_before.clone(),
            start_time: Instant::now(),
        };
        self.shared
            .active
            .lock()
            .unwrap()
            .insert(worktree.index, record);
        self.shared.observer.notify(WorkerEvent::Spawned {
            stage_id: stage_id.as_str().to_string(),
            worktree_index: worktree.index,
        });

        let this = self.clone();
        let worktree_index = worktree.index;
        let request = SpawnRequest {
            stage_id: stage_id.as_str().to_string(),
            stage_file_path: path,
            skill_name,
            worktree_path: worktree.path,
            worktree_index,
            model: None,
            env: vec![("WORKTREE_INDEX".to_string(), worktree_index.to_string())],
        };
        std::thread::spawn(move || {
            let outcome = this.shared.session_executor.spawn(request);
            this.handle_exit(worktree_index, outcome);
        });

        Ok(true)
    }

    /// §4.12: worker exit handling. Always releases the lock, removes the
    /// worktree, and signals the slot-free waiter, regardless of outcome.
    fn handle_exit(&self, worktree_index: usize, outcome: Result<crate::ports::SpawnOutcome>) {
        let record = {
            let mut active = self.shared.active.lock().unwrap();
            active.remove(&worktree_index)
        };
        let Some(record) = record else {
            tracing::error!(worktree_index, "exit handling: no worker record for index");
            return;
        };

        let (exit_code, session_errored) = match outcome {
            Ok(o) => (o.exit_code, false),
            Err(e) => {
                tracing::error!(stage = %record.stage_id, error = %e, "session error");
                (-1, true)
            }
        };

        let new_status = locker::read_status(&record.stage_file_path).ok();
        let status_changed = new_status
            .as_deref()
            .is_some_and(|s| s != record.status_before);

        if session_errored {
            tracing::error!(stage = %record.stage_id, "worker exited via session error");
        } else if status_changed {
            tracing::info!(stage = %record.stage_id, exit_code, "worker completed, status changed");
            if let Some(new_status) = &new_status {
                if let Err(e) = exit_gate::run(
                    &record.stage_id,
                    new_status,
                    &self.shared.config.repo_root,
                    self.shared.id_to_path.as_ref(),
                    self.shared.sync_hook.as_ref(),
                ) {
                    tracing::error!(stage = %record.stage_id, error = %e, "exit gate failed");
                }
            }
        } else if exit_code != 0 {
            tracing::warn!(stage = %record.stage_id, exit_code, "worker crashed");
        } else {
            tracing::info!(stage = %record.stage_id, "worker completed without status change");
        }

        let _ = locker::release_lock(&record.stage_file_path);
        let mut pool = self.shared.worktree_pool.lock().unwrap();
        if let Err(e) = pool.remove(&record.worktree_path) {
            tracing::error!(stage = %record.stage_id, error = %e, "failed to remove worktree");
        }
        drop(pool);

        self.shared.observer.notify(WorkerEvent::Exited {
            stage_id: record.stage_id.as_str().to_string(),
            exit_code,
            status_changed,
        });

        let _guard = self.shared.active.lock().unwrap();
        self.shared.cond.notify_all();
    }

    /// Run the Chain Manager and Comment Poller once (exposed for the cron
    /// scheduler to invoke on its own interval, §4.8-§4.10).
    pub fn run_chain_scan(&self, default_base_branch: &str) -> Vec<crate::chain::RowOutcome> {
        let id_to_path = self.shared.id_to_path.as_ref();
        let manager = ChainManager {
            tracking_store: self.shared.tracking_store.as_ref(),
            code_host: self.shared.code_host.as_ref(),
            session_executor: Some(Arc::clone(&self.shared.session_executor)),
            default_base_branch,
            resolve_stage_path: &|id| id_to_path(id),
            rebase_conflict_flag: &|id| {
                id_to_path(id)
                    .and_then(|p| workitem::read_stage(&p).ok())
                    .map(|s| s.rebase_conflict)
                    .unwrap_or(false)
            },
            child_pr_number: &|id| {
                id_to_path(id)
                    .and_then(|p| workitem::read_stage(&p).ok())
                    .and_then(|s| s.pr_number)
            },
            is_reviewable: &|id| {
                id_to_path(id)
                    .and_then(|p| workitem::read_stage(&p).ok())
                    .map(|s| {
                        s.status == comments::PR_CREATED_STATUS
                            || s.status == comments::ADDRESSING_COMMENTS_STATUS
                    })
                    .unwrap_or(false)
            },
        };
        manager.scan()
    }

    pub fn poll_comments(
        &self,
        stages: &[(WorkItemId, PathBuf, String, i64)],
    ) -> Vec<(WorkItemId, comments::PollOutcome)> {
        let id_to_path = self.shared.id_to_path.as_ref();
        comments::poll_all(
            stages,
            &self.shared.config.repo_root,
            self.shared.code_host.as_ref(),
            self.shared.comment_store.as_ref(),
            self.shared.sync_hook.as_ref(),
            |id| id_to_path(id),
        )
    }
}

fn write_status(path: &std::path::Path, status: &str) -> Result<()> {
    let mut doc = crate::frontmatter::read(path)?;
    doc.data
        .insert("status", crate::frontmatter::Value::from(status));
    crate::frontmatter::write(path, &doc.data, &doc.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{
        DependencyEdge, PrStatus, SpawnOutcome, StageRow, TicketRow, TrackingRow,
    };
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct EmptySource;
    impl DiscoverySource for EmptySource {
        fn stage_rows(&self) -> Result<Vec<StageRow>> {
            Ok(vec![])
        }
        fn dependency_edges(&self) -> Result<Vec<DependencyEdge>> {
            Ok(vec![])
        }
        fn ticket_rows(&self) -> Result<Vec<TicketRow>> {
            Ok(vec![])
        }
    }

    struct NoopHost;
    impl CodeHostAdapter for NoopHost {
        fn get_pr_status(&self, _: &str) -> Result<PrStatus> {
            Ok(PrStatus {
                merged: false,
                has_unresolved_comments: false,
                state: "OPEN".into(),
            })
        }
        fn get_branch_head(&self, _: &str) -> Result<String> {
            Ok("sha".into())
        }
        fn edit_pr_base(&self, _: i64, _: &str) -> Result<()> {
            Ok(())
        }
        fn mark_pr_ready(&self, _: i64) -> Result<()> {
            Ok(())
        }
    }

    struct CountingExecutor(Arc<AtomicUsize>);
    impl SessionExecutor for CountingExecutor {
        fn spawn(&self, _req: SpawnRequest) -> Result<SpawnOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(SpawnOutcome {
                exit_code: 0,
                duration_ms: 1,
            })
        }
    }

    struct NoopSync;
    impl SyncHook for NoopSync {
        fn sync(&self, _: &std::path::Path) -> Result<()> {
            Ok(())
        }
    }

    struct NoopTracking;
    impl TrackingStore for NoopTracking {
        fn rows_for_child(&self, _: &str) -> Result<Vec<TrackingRow>> {
            Ok(vec![])
        }
        fn all_rows(&self) -> Result<Vec<TrackingRow>> {
            Ok(vec![])
        }
        fn update_row(&self, _: &TrackingRow) -> Result<()> {
            Ok(())
        }
    }

    struct NoopComments;
    impl CommentStore for NoopComments {
        fn last_seen_count(&self, _: &str) -> Result<i64> {
            Ok(0)
        }
        fn set_last_seen_count(&self, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
    }

    fn pipeline() -> PipelineConfig {
        let content = "---\nworkflow:\n  entry_phase: Design\n  phases:\n    - name: Design\n      status: Design\n      skill: phase-design\n      transitions_to: [Build]\n---\n";
        PipelineConfig::parse(&crate::frontmatter::parse(content).unwrap().data).unwrap()
    }

    fn build_orchestrator(repo_root: PathBuf, exec_count: Arc<AtomicUsize>) -> Orchestrator {
        OrchestratorBuilder::new(
            OrchestratorConfig {
                repo_root,
                max_parallel: 2,
                idle: Duration::from_millis(10),
            },
            pipeline(),
            Box::new(EmptySource),
            Box::new(NoopHost),
            Arc::new(CountingExecutor(exec_count)),
            Box::new(NoopSync),
            Box::new(NoopTracking),
            Box::new(NoopComments),
            Box::new(|_: &WorkItemId| None),
            Box::new(|_: &str| vec![]),
        )
        .build()
    }

    #[test]
    fn start_then_start_again_errors() {
        let dir = TempDir::new().unwrap();
        let exec_count = Arc::new(AtomicUsize::new(0));
        let orch = build_orchestrator(dir.path().to_path_buf(), exec_count);
        let orch2 = orch.clone();
        let handle = std::thread::spawn(move || orch2.start(false));
        // Give the loop a moment to flip `running`.
        std::thread::sleep(Duration::from_millis(20));
        assert!(orch.start(false).is_err());
        orch.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_start_after_stop_succeeds() {
        let dir = TempDir::new().unwrap();
        let exec_count = Arc::new(AtomicUsize::new(0));
        let orch = build_orchestrator(dir.path().to_path_buf(), exec_count);

        let once_result = orch.start(true);
        assert!(once_result.is_ok());
        assert_eq!(orch.state(), LoopState::Terminated);

        orch.stop();
        orch.stop();

        let result = orch.start(true);
        assert!(result.is_ok());
    }

    #[test]
    fn once_mode_with_no_ready_stages_terminates_immediately() {
        let dir = TempDir::new().unwrap();
        let exec_count = Arc::new(AtomicUsize::new(0));
        let orch = build_orchestrator(dir.path().to_path_buf(), exec_count.clone());
        orch.start(true).unwrap();
        assert_eq!(exec_count.load(Ordering::SeqCst), 0);
        assert_eq!(orch.active_count(), 0);
    }
}
