//! Resolver Runner (§4.6): pure `(stage, ctx) -> Option<status>` functions
//! that advance a stage without spawning a worker.
//!
//! Grounded on `sipag-core/src/worker/reconciliation.rs`'s
//! `reconcile_merged_prs` (poll PR state, rewrite status on merge) —
//! generalized into a pure function so it is unit-testable without I/O, per
//! §4.6's "each resolver is a pure synchronous function".

use crate::ports::CodeHostAdapter;
use crate::workitem::Stage;

/// Everything a resolver is allowed to see: process env and, optionally, the
/// code-host adapter (§4.6).
pub struct ResolverContext<'a> {
    pub code_host: Option<&'a dyn CodeHostAdapter>,
}

/// `pr-status`: merged wins over unresolved comments (§4.6, P7).
pub fn pr_status(stage: &Stage, ctx: &ResolverContext) -> Option<String> {
    let pr_url = stage.pr_url.as_deref()?;
    let code_host = ctx.code_host?;
    let status = match code_host.get_pr_status(pr_url) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(stage = %stage.id, error = %e, "pr-status resolver errored, treating as no-op");
            return None;
        }
    };
    if status.merged {
        return Some("Done".to_string());
    }
    if status.has_unresolved_comments {
        return Some("Addressing Comments".to_string());
    }
    None
}

/// `stage-router`: project-specific dispatch stub; returns `None` by default
/// (§4.6).
pub fn stage_router(_stage: &Stage, _ctx: &ResolverContext) -> Option<String> {
    None
}

/// Run the named resolver, treating an unrecognised name the same as an
/// internal exception: logged, returns `None` (§7 "Resolver: internal
/// exception -> treat as returning null").
pub fn run_resolver(name: &str, stage: &Stage, ctx: &ResolverContext) -> Option<String> {
    match name {
        "pr-status" => pr_status(stage, ctx),
        "stage-router" => stage_router(stage, ctx),
        other => {
            tracing::warn!(resolver = other, "unknown resolver name, treating as no-op");
            None
        }
    }
}
