//! Filesystem-backed `DiscoverySource`: walks the work-item tree directly
//! instead of querying a synced read model. The SQLite read model and its
//! sync step are named as an external collaborator out of scope for the
//! core (§1/§6); this is the minimal adapter a CLI driver needs to feed the
//! core's `DiscoverySource` trait from the markdown tree on disk.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sipag_core::discovery::{COLUMN_BACKLOG, COLUMN_DONE, COLUMN_READY_FOR_WORK};
use sipag_core::ports::{DependencyEdge, DiscoverySource, StageRow, TicketRow};
use sipag_core::workitem::{self, WorkItemId, STATUS_COMPLETE, STATUS_NOT_STARTED};

pub struct FsDiscoverySource {
    repo_root: PathBuf,
}

impl FsDiscoverySource {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }
}

fn walk_markdown(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = path.file_name().and_then(|n| n.to_str());
            if matches!(name, Some(".sipag") | Some(".worktrees") | Some(".git")) {
                continue;
            }
            walk_markdown(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
}

fn id_prefix(id: &str) -> &str {
    id.split('-').next().unwrap_or("")
}

/// Resolve a work-item id to its file path by walking the tree and matching
/// the `id` frontmatter field (used as the core's `id_to_path` lookup).
pub fn resolve_path(repo_root: &Path, id: &str) -> Option<PathBuf> {
    let mut paths = Vec::new();
    walk_markdown(repo_root, &mut paths);
    paths.into_iter().find(|p| {
        sipag_core::frontmatter::read(p)
            .ok()
            .and_then(|doc| doc.data.get_str("id").map(|s| s.to_string()))
            .as_deref()
            == Some(id)
    })
}

/// Stages currently in `PR Created` with a known PR url, for the comment
/// poller cron job.
pub fn pr_created_stages(repo_root: &Path, status: &str) -> Vec<(WorkItemId, PathBuf, String)> {
    let mut paths = Vec::new();
    walk_markdown(repo_root, &mut paths);
    paths
        .into_iter()
        .filter(|p| id_prefix_of_path(p) == "STAGE")
        .filter_map(|p| {
            let stage = workitem::read_stage(&p).ok()?;
            if stage.status == status {
                let pr_url = stage.pr_url.clone()?;
                Some((stage.id.clone(), p, pr_url))
            } else {
                None
            }
        })
        .collect()
}

/// All stages currently sitting at `status`, for the resolver sweep.
pub fn stages_with_status(repo_root: &Path, status: &str) -> Vec<(WorkItemId, PathBuf)> {
    let mut paths = Vec::new();
    walk_markdown(repo_root, &mut paths);
    paths
        .into_iter()
        .filter(|p| id_prefix_of_path(p) == "STAGE")
        .filter_map(|p| {
            let stage = workitem::read_stage(&p).ok()?;
            if stage.status == status {
                Some((stage.id.clone(), p))
            } else {
                None
            }
        })
        .collect()
}

fn id_prefix_of_path(path: &Path) -> String {
    sipag_core::frontmatter::read(path)
        .ok()
        .and_then(|doc| doc.data.get_str("id").map(|s| id_prefix(s).to_string()))
        .unwrap_or_default()
}

fn kanban_column_for(status: &str, unresolved_deps: bool) -> &'static str {
    if unresolved_deps {
        COLUMN_BACKLOG
    } else if status == STATUS_COMPLETE {
        COLUMN_DONE
    } else if status == STATUS_NOT_STARTED {
        COLUMN_READY_FOR_WORK
    } else {
        "in_progress"
    }
}

/// A dependency target (stage or ticket) is resolved once its own status is
/// `Complete`; anything else, including an id this tree can't find, blocks.
fn dependency_resolved(repo_root: &Path, dep_id: &str) -> bool {
    resolve_path(repo_root, dep_id)
        .and_then(|p| sipag_core::frontmatter::read(&p).ok())
        .and_then(|doc| doc.data.get_str("status").map(|s| s.to_string()))
        .map(|s| s == STATUS_COMPLETE)
        .unwrap_or(false)
}

impl DiscoverySource for FsDiscoverySource {
    fn stage_rows(&self) -> Result<Vec<StageRow>> {
        let mut paths = Vec::new();
        walk_markdown(&self.repo_root, &mut paths);
        let mut rows = Vec::new();
        for path in paths {
            if id_prefix_of_path(&path) != "STAGE" {
                continue;
            }
            let stage = workitem::read_stage(&path)?;
            let unresolved_deps = stage
                .depends_on
                .iter()
                .any(|dep| !dependency_resolved(&self.repo_root, dep.as_str()));
            rows.push(StageRow {
                id: stage.id,
                ticket: stage.ticket,
                epic: stage.epic,
                title: stage.title,
                kanban_column: kanban_column_for(&stage.status, unresolved_deps).to_string(),
                status: stage.status,
                priority: stage.priority,
                due_date: stage.due_date,
                session_active: stage.session_active,
                worktree_branch: stage.worktree_branch,
                refinement_type: stage.refinement_type,
                file_path: stage.file_path,
            });
        }
        Ok(rows)
    }

    fn dependency_edges(&self) -> Result<Vec<DependencyEdge>> {
        let mut paths = Vec::new();
        walk_markdown(&self.repo_root, &mut paths);
        let mut edges = Vec::new();
        for path in paths {
            if id_prefix_of_path(&path) != "STAGE" {
                continue;
            }
            let stage = workitem::read_stage(&path)?;
            for dep in &stage.depends_on {
                edges.push(DependencyEdge {
                    stage_id: stage.id.clone(),
                    depends_on: dep.clone(),
                    resolved: dependency_resolved(&self.repo_root, dep.as_str()),
                });
            }
        }
        Ok(edges)
    }

    fn ticket_rows(&self) -> Result<Vec<TicketRow>> {
        let mut paths = Vec::new();
        walk_markdown(&self.repo_root, &mut paths);
        let mut rows = Vec::new();
        for path in paths {
            if id_prefix_of_path(&path) != "TICKET" {
                continue;
            }
            let ticket = workitem::read_ticket(&path)?;
            rows.push(TicketRow {
                has_stages: !ticket.stage_statuses.is_empty(),
                id: ticket.id,
            });
        }
        Ok(rows)
    }
}
