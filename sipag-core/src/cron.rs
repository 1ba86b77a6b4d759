//! Cron Scheduler (§4.8): one background timer per enabled job, with an
//! `executing` guard so overlapping runs are skipped rather than queued.
//!
//! Grounded on `sipag-core/src/worker/loop_runner.rs`'s top-level
//! `loop { ... sleep(poll_interval) }` shape, split into N independent
//! per-job timers since the comment poller and chain manager run on
//! different intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A single cron job: a name, an enabled flag, an interval, and the closure
/// it runs each tick.
pub struct CronJob {
    pub name: String,
    pub enabled: bool,
    pub interval: Duration,
    pub execute: Box<dyn Fn() + Send + Sync>,
}

/// A cancellable timer: a `Condvar` paired with a `Mutex`-guarded stop flag,
/// per §9's "cancellable sleep → timer with a cancel handle" design note —
/// `stop()` wakes every job immediately instead of waiting out its interval.
struct CancelHandle {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Sleep up to `d`, waking early if `cancel()` is called. Returns `true`
    /// if the wait was cancelled.
    fn wait(&self, d: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cond.wait_timeout(guard, d).unwrap();
        *guard
    }

    fn cancel(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

struct RunningJob {
    cancel: Arc<CancelHandle>,
    handle: JoinHandle<()>,
}

/// Runs a static list of jobs, one thread-timer per enabled job.
pub struct CronScheduler {
    running: Vec<RunningJob>,
}

impl CronScheduler {
    /// Start every enabled job on its own timer thread.
    pub fn start(jobs: Vec<CronJob>) -> Self {
        let mut running = Vec::new();
        for job in jobs {
            if !job.enabled {
                tracing::info!(job = %job.name, "cron job disabled, not starting");
                continue;
            }
            let cancel = Arc::new(CancelHandle::new());
            let cancel_clone = cancel.clone();
            let executing = Arc::new(AtomicBool::new(false));
            let interval = job.interval;
            let name = job.name.clone();
            let execute = Arc::new(job.execute);

            let handle = std::thread::spawn(move || loop {
                if cancel_clone.wait(interval) {
                    break;
                }
                if executing
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    tracing::debug!(job = %name, "previous run still in flight, skipping this tick");
                    continue;
                }
                let exec = execute.clone();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| exec()));
                if let Err(e) = result {
                    tracing::error!(job = %name, panic = ?e, "cron job panicked");
                }
                executing.store(false, Ordering::SeqCst);
            });

            running.push(RunningJob { cancel, handle });
        }
        Self { running }
    }

    /// Cancel every timer promptly. In-flight jobs finish on their own.
    pub fn stop(self) {
        for job in &self.running {
            job.cancel.cancel();
        }
        for job in self.running {
            let _ = job.handle.join();
        }
    }
}
