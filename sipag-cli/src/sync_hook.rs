//! `ShellSyncHook`: implements `SyncHook` by re-syncing the frontmatter read
//! model from the working tree (§4.7: "called after every status write;
//! retried once on failure, and never blocks on its own success").
//!
//! Grounded on `sipag-core/src/code_host.rs`'s `run_gh` shelling idiom, here
//! running a configurable sync command rather than a fixed `gh` call, since
//! the sync step itself (SQLite read-model refresh) is out of scope per §1.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use sipag_core::ports::SyncHook;

const SYNC_COMMAND_ENV: &str = "SIPAG_SYNC_COMMAND";

pub struct ShellSyncHook {
    command: Option<String>,
}

impl ShellSyncHook {
    pub fn new() -> Self {
        Self {
            command: std::env::var(SYNC_COMMAND_ENV).ok(),
        }
    }
}

impl Default for ShellSyncHook {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHook for ShellSyncHook {
    fn sync(&self, repo_path: &Path) -> Result<()> {
        let Some(command) = &self.command else {
            // No sync command configured: the filesystem read source already
            // reads straight off the tree, so there is nothing to refresh.
            return Ok(());
        };
        let status = Command::new(command)
            .current_dir(repo_path)
            .status()
            .with_context(|| format!("failed to spawn sync command `{command}`"))?;
        if status.success() {
            Ok(())
        } else {
            anyhow::bail!("sync command `{command}` exited with {status}")
        }
    }
}
