//! Bounded pool of isolated git worktree checkouts, indexed `1..=N`.
//!
//! Grounded on `sipag-core/src/worker/docker_runtime.rs` and
//! `sipag-core/src/worker/dispatch.rs` for the "shell out, check exit
//! status, fall back to a cruder mechanism" idiom used against external
//! tooling; the bounded-index allocation mirrors
//! `sipag-core/src/worker/work_config.rs`'s capped `batch_size`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::OrchestratorError;
use crate::procutil::run_with_timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A single acquired worktree: its on-disk path, branch, and pool index.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub index: usize,
}

/// Bounded pool of worktree slots `1..=capacity`.
pub struct WorktreePool {
    capacity: usize,
    reserved: Vec<bool>,
    repo_root: PathBuf,
    tracked: Vec<Option<PathBuf>>,
    isolation_validated: bool,
}

impl WorktreePool {
    pub fn new(repo_root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            capacity,
            reserved: vec![false; capacity],
            repo_root: repo_root.into(),
            tracked: vec![None; capacity],
            isolation_validated: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.reserved.iter().filter(|r| **r).count()
    }

    /// Returns the lowest free index in `1..=N`, or `PoolExhausted`.
    pub fn acquire_index(&mut self) -> Result<usize> {
        for (i, used) in self.reserved.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i + 1);
            }
        }
        Err(OrchestratorError::PoolExhausted {
            capacity: self.capacity,
        }
        .into())
    }

    fn release_index(&mut self, index: usize) {
        if index >= 1 && index <= self.capacity {
            self.reserved[index - 1] = false;
            self.tracked[index - 1] = None;
        }
    }

    fn worktree_dir(&self, index: usize) -> PathBuf {
        self.repo_root.join(".worktrees").join(format!("worktree-{index}"))
    }

    /// One-shot precondition (§4.3): `CLAUDE.md` must carry a "Worktree
    /// Isolation Strategy" section with at least three sub-headings.
    /// Cached for the life of one `start()` invocation.
    pub fn validate_isolation_strategy(&mut self) -> Result<()> {
        if self.isolation_validated {
            return Ok(());
        }
        let claude_md = self.repo_root.join("CLAUDE.md");
        let content = std::fs::read_to_string(&claude_md).with_context(|| {
            format!(
                "CLAUDE.md not found at {} — required by the isolation strategy precondition",
                claude_md.display()
            )
        })?;

        let mut in_section = false;
        let mut section_level_found = 0usize;
        let mut sub_headings = 0usize;
        for line in content.lines() {
            let trimmed = line.trim_end();
            if !trimmed.starts_with('#') {
                continue;
            }
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            let heading = trimmed.trim_start_matches('#').trim();

            if in_section && level <= section_level_found {
                in_section = false;
            }
            if !in_section && heading.eq_ignore_ascii_case("Worktree Isolation Strategy") {
                in_section = true;
                section_level_found = level;
                continue;
            }
            if in_section && level > section_level_found {
                sub_headings += 1;
            }
        }

        anyhow::ensure!(
            sub_headings >= 3,
            "CLAUDE.md's \"Worktree Isolation Strategy\" section must have at least 3 sub-headings (found {sub_headings})"
        );
        self.isolation_validated = true;
        Ok(())
    }

    /// Acquire an index and materialise an isolated checkout of `branch`,
    /// creating the branch if it does not already exist.
    pub fn create(&mut self, branch: &str) -> Result<Worktree> {
        let index = self.acquire_index()?;
        let path = self.worktree_dir(index);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let branch_exists =
            run_git(&self.repo_root, &["rev-parse", "--verify", branch]).unwrap_or(false);

        let result = if branch_exists {
            run_git_checked(
                &self.repo_root,
                &["worktree", "add", path.to_str().unwrap_or_default(), branch],
            )
        } else {
            run_git_checked(
                &self.repo_root,
                &[
                    "worktree",
                    "add",
                    "-b",
                    branch,
                    path.to_str().unwrap_or_default(),
                ],
            )
        };

        if let Err(e) = result {
            self.release_index(index);
            return Err(e).context(format!("failed to create worktree for branch {branch}"));
        }

        self.tracked[index - 1] = Some(path.clone());
        tracing::info!(branch, index, path = %path.display(), "worktree created");
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            index,
        })
    }

    /// Idempotent removal: try a polite `git worktree remove --force` first,
    /// fall back to a recursive delete plus `git worktree prune`. Fails
    /// loudly if `path` was never tracked by this pool.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let index = self
            .tracked
            .iter()
            .position(|p| p.as_deref() == Some(path))
            .map(|i| i + 1);

        let Some(index) = index else {
            return Err(OrchestratorError::UntrackedRemoval {
                path: path.display().to_string(),
            }
            .into());
        };

        let polite = run_git_checked(
            &self.repo_root,
            &["worktree", "remove", "--force", path.to_str().unwrap_or_default()],
        );
        if polite.is_err() {
            tracing::warn!(path = %path.display(), "polite worktree remove failed, falling back to rm + prune");
            let _ = std::fs::remove_dir_all(path);
            let _ = run_git_checked(&self.repo_root, &["worktree", "prune"]);
        }

        self.release_index(index);
        tracing::info!(path = %path.display(), "worktree removed");
        Ok(())
    }
}

fn run_git(repo_root: &Path, args: &[&str]) -> Result<bool> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_root).args(args);
    let output = run_with_timeout(cmd, COMMAND_TIMEOUT).context("failed to spawn git")?;
    Ok(output.status.success())
}

fn run_git_checked(repo_root: &Path, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_root).args(args);
    let output = run_with_timeout(cmd, COMMAND_TIMEOUT).context("failed to spawn git")?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
