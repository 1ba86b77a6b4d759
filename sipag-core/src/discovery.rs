//! Stage discovery and priority scoring (§4.4).
//!
//! Grounded on `sipag-core/src/worker/cycle.rs`'s `plan_cycle()` — a pure
//! function over a repository snapshot that decides what to dispatch next —
//! generalized from "open issues with a label" to "stages past their
//! dependency gate, scored by phase + priority + due date".

use chrono::{NaiveDate, Utc};

use crate::pipeline::PipelineConfig;
use crate::ports::{DependencyEdge, DiscoverySource, StageRow, TicketRow};

pub const COLUMN_BACKLOG: &str = "backlog";
pub const COLUMN_DONE: &str = "done";
pub const COLUMN_READY_FOR_WORK: &str = "ready_for_work";

/// A ready stage, scored and ranked (§4.4).
#[derive(Debug, Clone)]
pub struct ReadyStage {
    pub row: StageRow,
    pub score: i64,
    pub priority_reason: String,
    pub needs_human: bool,
}

/// Counts returned alongside the ready list (§4.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryCounts {
    pub blocked: usize,
    pub in_progress: usize,
    pub to_convert: usize,
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub ready: Vec<ReadyStage>,
    pub counts: DiscoveryCounts,
}

/// Run discovery against a `DiscoverySource` and the pipeline config,
/// returning up to `limit` ready stages ordered by descending score.
///
/// Tie-break among equal scores is deliberately left unstable: §9's open
/// questions disclaim a FIFO contract, so this performs a plain unstable
/// sort rather than implying an ordering guarantee that was never promised.
pub fn discover(
    source: &dyn DiscoverySource,
    pipeline: &PipelineConfig,
    limit: usize,
) -> anyhow::Result<DiscoveryResult> {
    let stages = source.stage_rows()?;
    let edges = source.dependency_edges()?;
    let tickets = source.ticket_rows()?;

    let counts = compute_counts(&stages, &edges, &tickets);
    let mut ready: Vec<ReadyStage> = stages
        .into_iter()
        .filter(|s| is_ready(s, &edges))
        .map(|row| score_stage(row, pipeline))
        .collect();

    ready.sort_unstable_by(|a, b| b.score.cmp(&a.score));
    ready.truncate(limit);

    Ok(DiscoveryResult { ready, counts })
}

fn has_unresolved_deps(stage_id: &str, edges: &[DependencyEdge]) -> bool {
    edges
        .iter()
        .any(|e| e.stage_id.as_str() == stage_id && !e.resolved)
}

fn is_ready(stage: &StageRow, edges: &[DependencyEdge]) -> bool {
    if stage.kanban_column == COLUMN_BACKLOG {
        return false;
    }
    if stage.kanban_column == COLUMN_DONE {
        return false;
    }
    if stage.session_active {
        return false;
    }
    !has_unresolved_deps(stage.id.as_str(), edges)
}

fn compute_counts(
    stages: &[StageRow],
    edges: &[DependencyEdge],
    tickets: &[TicketRow],
) -> DiscoveryCounts {
    let blocked = stages
        .iter()
        .filter(|s| s.kanban_column == COLUMN_BACKLOG || has_unresolved_deps(s.id.as_str(), edges))
        .count();
    let in_progress = stages.iter().filter(|s| s.session_active).count();
    let to_convert = tickets.iter().filter(|t| !t.has_stages).count();
    DiscoveryCounts {
        blocked,
        in_progress,
        to_convert,
    }
}

fn phase_base_score(pipeline: &PipelineConfig, stage: &StageRow) -> (i64, String) {
    if let Some(phase) = pipeline.lookup(&stage.status) {
        let lower = phase.name.to_lowercase();
        if phase.name == "Addressing Comments" {
            return (700, "review_comments_pending".to_string());
        }
        if lower.contains("manual") {
            return (600, "manual_testing_pending".to_string());
        }
        if lower.contains("automatic") {
            return (500, "automatic_testing_ready".to_string());
        }
        if phase.name == "Build" {
            return (400, "build_ready".to_string());
        }
        let slug = lower.replace(' ', "_");
        return (200, format!("{slug}_ready"));
    }

    if stage.kanban_column == COLUMN_READY_FOR_WORK {
        return (300, "design_ready".to_string());
    }
    (0, "normal".to_string())
}

fn due_date_bonus(due_date: Option<NaiveDate>) -> i64 {
    let Some(due) = due_date else { return 0 };
    let today = Utc::now().date_naive();
    let days_until_due = (due - today).num_days();
    if days_until_due < 0 {
        return 0;
    }
    let bonus = 50.0 - (days_until_due as f64 / 30.0) * 50.0;
    bonus.round().max(0.0) as i64
}

fn needs_human(pipeline: &PipelineConfig, stage: &StageRow) -> bool {
    pipeline
        .lookup(&stage.status)
        .map(|phase| {
            let lower = phase.name.to_lowercase();
            lower.contains("manual") || lower.contains("user") || lower.contains("feedback")
        })
        .unwrap_or(false)
}

fn score_stage(row: StageRow, pipeline: &PipelineConfig) -> ReadyStage {
    let (base, priority_reason) = phase_base_score(pipeline, &row);
    let priority_bonus = row.priority * 10;
    let due_bonus = due_date_bonus(row.due_date);
    let score = base + priority_bonus + due_bonus;
    let human = needs_human(pipeline, &row);
    ReadyStage {
        row,
        score,
        priority_reason,
        needs_human: human,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontmatter;
    use crate::workitem::WorkItemId;
    use std::path::PathBuf;

    fn pipeline() -> PipelineConfig {
        let content = "---\nworkflow:\n  entry_phase: Design\n  phases:\n    - name: Design\n      status: Design\n      skill: phase-design\n      transitions_to: [Build]\n    - name: Build\n      status: Build\n      skill: phase-build\n      transitions_to: [Done]\n    - name: Manual Testing\n      status: Manual Testing\n      skill: phase-manual\n      transitions_to: [Done]\n    - name: Addressing Comments\n      status: Addressing Comments\n      skill: phase-address\n      transitions_to: [Design]\n---\n";
        PipelineConfig::parse(&frontmatter::parse(content).unwrap().data).unwrap()
    }

    fn row(id: &str, status: &str, column: &str, priority: i64) -> StageRow {
        StageRow {
            id: WorkItemId::from(id),
            ticket: WorkItemId::from("TICKET-1-1"),
            epic: WorkItemId::from("EPIC-1"),
            title: "t".to_string(),
            status: status.to_string(),
            kanban_column: column.to_string(),
            priority,
            due_date: None,
            session_active: false,
            worktree_branch: None,
            refinement_type: vec![],
            file_path: PathBuf::from(format!("{id}.md")),
        }
    }

    #[test]
    fn phase_outranking_matches_p6() {
        let p = pipeline();
        let (comments, _) = phase_base_score(&p, &row("S1", "Addressing Comments", "x", 0));
        let (manual, _) = phase_base_score(&p, &row("S2", "Manual Testing", "x", 0));
        let (build, _) = phase_base_score(&p, &row("S3", "Build", "x", 0));
        let (design, _) = phase_base_score(&p, &row("S4", "Design", "x", 0));
        assert!(comments > manual);
        assert!(manual > build);
        assert!(build > design);
    }

    #[test]
    fn priority_bonus_is_exactly_ten_per_point() {
        let p = pipeline();
        let low = score_stage(row("S1", "Build", "x", 0), &p).score;
        let high = score_stage(row("S2", "Build", "x", 1), &p).score;
        assert_eq!(high - low, 10);
    }

    #[test]
    fn excludes_backlog_session_active_and_done() {
        struct Src {
            stages: Vec<StageRow>,
        }
        impl DiscoverySource for Src {
            fn stage_rows(&self) -> anyhow::Result<Vec<StageRow>> {
                Ok(self.stages.clone())
            }
            fn dependency_edges(&self) -> anyhow::Result<Vec<DependencyEdge>> {
                Ok(vec![])
            }
            fn ticket_rows(&self) -> anyhow::Result<Vec<TicketRow>> {
                Ok(vec![])
            }
        }
        let mut backlog = row("S1", "Design", COLUMN_BACKLOG, 0);
        backlog.session_active = false;
        let mut active = row("S2", "Build", "in_progress", 0);
        active.session_active = true;
        let done = row("S3", "Done", COLUMN_DONE, 0);
        let ready_one = row("S4", "Build", "in_progress", 5);

        let src = Src {
            stages: vec![backlog, active, done, ready_one],
        };
        let result = discover(&src, &pipeline(), 10).unwrap();
        assert_eq!(result.ready.len(), 1);
        assert_eq!(result.ready[0].row.id.as_str(), "S4");
        assert_eq!(result.counts.blocked, 1);
        assert_eq!(result.counts.in_progress, 1);
    }

    #[test]
    fn needs_human_true_for_manual_phase() {
        let p = pipeline();
        assert!(needs_human(&p, &row("S1", "Manual Testing", "x", 0)));
        assert!(!needs_human(&p, &row("S2", "Build", "x", 0)));
    }

    #[test]
    fn due_date_bonus_clamped_to_zero_when_past_due() {
        let past = Utc::now().date_naive() - chrono::Duration::days(5);
        assert_eq!(due_date_bonus(Some(past)), 0);
    }

    #[test]
    fn due_date_bonus_is_fifty_when_due_today() {
        let today = Utc::now().date_naive();
        assert_eq!(due_date_bonus(Some(today)), 50);
    }
}
