//! `ShellSessionExecutor`: implements `SessionExecutor` by shelling out to a
//! configurable worker-session command, one process per stage (§6 "spawn
//! ({...}) -> {exitCode, durationMs}").
//!
//! Grounded on `sipag-core/src/code_host.rs`'s `run_gh` shelling idiom,
//! adapted from a fixed `gh` invocation to a configurable command template
//! (the session executor itself is out of scope per §1; this wires whatever
//! command the operator configures).

use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result};
use sipag_core::ports::{SessionExecutor, SpawnOutcome, SpawnRequest};

const DEFAULT_COMMAND_ENV: &str = "SIPAG_SESSION_COMMAND";
const DEFAULT_COMMAND: &str = "sipag-worker";

pub struct ShellSessionExecutor {
    command: String,
}

impl ShellSessionExecutor {
    pub fn new() -> Self {
        let command = std::env::var(DEFAULT_COMMAND_ENV).unwrap_or_else(|_| DEFAULT_COMMAND.to_string());
        Self { command }
    }
}

impl Default for ShellSessionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionExecutor for ShellSessionExecutor {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.command);
        cmd.current_dir(&request.worktree_path)
            .env("SIPAG_STAGE_ID", &request.stage_id)
            .env("SIPAG_STAGE_FILE", &request.stage_file_path)
            .env("SIPAG_SKILL", &request.skill_name)
            .env("SIPAG_WORKTREE_INDEX", request.worktree_index.to_string());
        if let Some(model) = &request.model {
            cmd.env("SIPAG_MODEL", model);
        }
        for (k, v) in &request.env {
            cmd.env(k, v);
        }

        let status = cmd
            .status()
            .with_context(|| format!("failed to spawn session command `{}`", self.command))?;
        Ok(SpawnOutcome {
            exit_code: status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
