//! `GhCliCodeHost`: implements `CodeHostAdapter` by shelling out to the `gh`
//! CLI, under the §5 30-second external-call ceiling.
//!
//! Grounded on `sipag-core/src/worker/github_gateway.rs` (`GhCliGateway`) —
//! the newest of three GitHub-gateway iterations in this workspace, picked
//! as the canonical "run_gh / run_gh_soft, parse JSON with serde_json"
//! shelling pattern and adapted from issue/PR-by-number lookups to
//! PR-by-url lookups plus branch-HEAD and base-retarget calls.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::ports::{CodeHostAdapter, PrStatus};
use crate::procutil::run_with_timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GhCliCodeHost;

impl GhCliCodeHost {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GhCliCodeHost {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PrView {
    state: String,
    #[serde(default)]
    #[serde(rename = "mergedAt")]
    merged_at: Option<String>,
    #[serde(default)]
    #[serde(rename = "reviewThreads")]
    review_threads: Vec<ReviewThread>,
}

#[derive(Debug, Deserialize)]
struct ReviewThread {
    #[serde(rename = "isResolved")]
    is_resolved: bool,
}

fn run_gh(args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("gh");
    cmd.args(args);
    let output = run_with_timeout(cmd, COMMAND_TIMEOUT).context("failed to spawn gh command")?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh {} failed: {}", args.join(" "), stderr.trim())
    }
}

impl CodeHostAdapter for GhCliCodeHost {
    fn get_pr_status(&self, pr_url: &str) -> Result<PrStatus> {
        let out = run_gh(&[
            "pr",
            "view",
            pr_url,
            "--json",
            "state,mergedAt,reviewThreads",
        ])?;
        let view: PrView = serde_json::from_str(&out)
            .with_context(|| format!("failed to parse gh pr view output for {pr_url}"))?;
        let merged = view.state == "MERGED" || view.merged_at.is_some();
        let has_unresolved_comments = view.review_threads.iter().any(|t| !t.is_resolved);
        Ok(PrStatus {
            merged,
            has_unresolved_comments,
            state: view.state,
        })
    }

    fn get_branch_head(&self, branch: &str) -> Result<String> {
        let out = run_gh(&["api", &format!("repos/{{owner}}/{{repo}}/git/ref/heads/{branch}")])?;
        #[derive(Deserialize)]
        struct RefResp {
            object: RefObject,
        }
        #[derive(Deserialize)]
        struct RefObject {
            sha: String,
        }
        let resp: RefResp = serde_json::from_str(&out)
            .with_context(|| format!("failed to parse branch HEAD for {branch}"))?;
        Ok(resp.object.sha)
    }

    fn edit_pr_base(&self, pr_number: i64, new_base: &str) -> Result<()> {
        run_gh(&[
            "pr",
            "edit",
            &pr_number.to_string(),
            "--base",
            new_base,
        ])?;
        Ok(())
    }

    fn mark_pr_ready(&self, pr_number: i64) -> Result<()> {
        run_gh(&["pr", "ready", &pr_number.to_string()])?;
        Ok(())
    }
}
