//! The three-level work-item hierarchy: epics contain tickets, tickets
//! contain stages. Each variant shares `id`, `title`, `status`,
//! `depends_on[]`, `file_path`; stages carry the bulk of the pipeline state.
//!
//! Grounded on `sipag-core/src/task/parser.rs` and `task/aggregate.rs` — a
//! single `Task` struct parsed out of a frontmatter map — generalized to the
//! three identifier kinds used here (`EPIC-a`, `TICKET-a-b`,
//! `STAGE-a-b-c`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use chrono::NaiveDate;

use crate::frontmatter::{self, FrontmatterMap, Value};

/// The kind of work item, derived from its identifier's prefix/segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemKind {
    Epic,
    Ticket,
    Stage,
}

/// A parsed work-item identifier, e.g. `STAGE-1-2-3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn kind(&self) -> Result<WorkItemKind> {
        let parts: Vec<&str> = self.0.split('-').collect();
        match parts.as_slice() {
            ["EPIC", _] => Ok(WorkItemKind::Epic),
            ["TICKET", _, _] => Ok(WorkItemKind::Ticket),
            ["STAGE", _, _, _] => Ok(WorkItemKind::Stage),
            _ => bail!("unrecognised work item id: {}", self.0),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(s: &str) -> Self {
        WorkItemId(s.to_string())
    }
}
impl From<String> for WorkItemId {
    fn from(s: String) -> Self {
        WorkItemId(s)
    }
}

/// A tracked parent-branch pending merge on a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMergeParent {
    pub parent_stage_id: String,
    pub branch: String,
    pub pr_url: Option<String>,
}

/// The leaf work item: a single unit of AI-assisted work.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: WorkItemId,
    pub title: String,
    pub status: String,
    pub depends_on: Vec<WorkItemId>,
    pub file_path: PathBuf,

    pub ticket: WorkItemId,
    pub epic: WorkItemId,
    pub refinement_type: Vec<String>,
    pub worktree_branch: Option<String>,
    pub priority: i64,
    pub due_date: Option<NaiveDate>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub session_active: bool,
    pub is_draft: bool,
    pub pending_merge_parents: Vec<PendingMergeParent>,
    pub rebase_conflict: bool,
}

/// A ticket: an aggregate of stages.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: WorkItemId,
    pub title: String,
    pub status: String,
    pub depends_on: Vec<WorkItemId>,
    pub file_path: PathBuf,

    pub epic: WorkItemId,
    /// Mapping from stage id to its last-observed status string.
    pub stage_statuses: BTreeMap<String, String>,
}

/// An epic: an aggregate of tickets.
#[derive(Debug, Clone)]
pub struct Epic {
    pub id: WorkItemId,
    pub title: String,
    pub status: String,
    pub depends_on: Vec<WorkItemId>,
    pub file_path: PathBuf,

    /// Mapping from ticket id to its last-observed derived status.
    pub ticket_statuses: BTreeMap<String, String>,
}

/// Reserved statuses that exist outside the configured pipeline phases.
pub const STATUS_NOT_STARTED: &str = "Not Started";
pub const STATUS_COMPLETE: &str = "Complete";
pub const STATUS_IN_PROGRESS: &str = "In Progress";

fn depends_on_from(data: &FrontmatterMap) -> Vec<WorkItemId> {
    data.get_string_list("depends_on")
        .into_iter()
        .map(WorkItemId::from)
        .collect()
}

fn required_str(data: &FrontmatterMap, key: &str, path: &Path) -> Result<String> {
    data.get_str(key)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("{}: missing required field `{key}`", path.display()))
}

/// Parse a stage from a frontmatter document already read from `path`.
pub fn parse_stage(path: &Path, data: &FrontmatterMap) -> Result<Stage> {
    let id = required_str(data, "id", path)?;
    let ticket = required_str(data, "ticket", path)?;
    let epic = required_str(data, "epic", path)?;
    let title = required_str(data, "title", path)?;
    let status = required_str(data, "status", path)?;

    let due_date = data
        .get_str("due_date")
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

    let pending_merge_parents = data
        .get_map_list("pending_merge_parents")
        .into_iter()
        .filter_map(|row| {
            Some(PendingMergeParent {
                parent_stage_id: row.get_str("parent_stage_id")?.to_string(),
                branch: row.get_str("branch").unwrap_or_default().to_string(),
                pr_url: row.get_str("pr_url").map(|s| s.to_string()),
            })
        })
        .collect();

    Ok(Stage {
        id: WorkItemId::from(id),
        title,
        status,
        depends_on: depends_on_from(data),
        file_path: path.to_path_buf(),
        ticket: WorkItemId::from(ticket),
        epic: WorkItemId::from(epic),
        refinement_type: data.get_string_list("refinement_type"),
        worktree_branch: data.get_str("worktree_branch").map(|s| s.to_string()),
        priority: data.get_int("priority", 0),
        due_date,
        pr_url: data.get_str("pr_url").map(|s| s.to_string()),
        pr_number: data.get("pr_number").and_then(Value::as_int),
        session_active: data.get_bool("session_active"),
        is_draft: data.get_bool("is_draft"),
        pending_merge_parents,
        rebase_conflict: data.get_bool("rebase_conflict"),
    })
}

/// Parse a ticket from a frontmatter document already read from `path`.
pub fn parse_ticket(path: &Path, data: &FrontmatterMap) -> Result<Ticket> {
    let id = required_str(data, "id", path)?;
    let epic = required_str(data, "epic", path)?;
    let title = required_str(data, "title", path)?;
    let status = required_str(data, "status", path)?;

    let mut stage_statuses = BTreeMap::new();
    if let Some(map) = data.get("stage_statuses").and_then(Value::as_map) {
        for (k, v) in map.iter() {
            if let Some(s) = v.as_str() {
                stage_statuses.insert(k.to_string(), s.to_string());
            }
        }
    }

    Ok(Ticket {
        id: WorkItemId::from(id),
        title,
        status,
        depends_on: depends_on_from(data),
        file_path: path.to_path_buf(),
        epic: WorkItemId::from(epic),
        stage_statuses,
    })
}

/// Parse an epic from a frontmatter document already read from `path`.
pub fn parse_epic(path: &Path, data: &FrontmatterMap) -> Result<Epic> {
    let id = required_str(data, "id", path)?;
    let title = required_str(data, "title", path)?;
    let status = required_str(data, "status", path)?;

    let mut ticket_statuses = BTreeMap::new();
    if let Some(map) = data.get("ticket_statuses").and_then(Value::as_map) {
        for (k, v) in map.iter() {
            if let Some(s) = v.as_str() {
                ticket_statuses.insert(k.to_string(), s.to_string());
            }
        }
    }

    Ok(Epic {
        id: WorkItemId::from(id),
        title,
        status,
        depends_on: depends_on_from(data),
        file_path: path.to_path_buf(),
        ticket_statuses,
    })
}

/// Read and parse a stage file from disk.
pub fn read_stage(path: &Path) -> Result<Stage> {
    let doc = frontmatter::read(path)?;
    parse_stage(path, &doc.data)
}

/// Read and parse a ticket file from disk.
pub fn read_ticket(path: &Path) -> Result<Ticket> {
    let doc = frontmatter::read(path)?;
    parse_ticket(path, &doc.data)
}

/// Read and parse an epic file from disk.
pub fn read_epic(path: &Path) -> Result<Epic> {
    let doc = frontmatter::read(path)?;
    parse_epic(path, &doc.data)
}

/// Derive a rollup status (§3 I4) from a map of child statuses.
///
/// `Complete` iff every child is `Complete`; `Not Started` iff every child
/// is `Not Started`; otherwise `In Progress`. An empty map is `Not Started`.
pub fn derive_status<'a>(children: impl Iterator<Item = &'a str>) -> String {
    let mut all_complete = true;
    let mut all_not_started = true;
    let mut any = false;
    for status in children {
        any = true;
        if status != STATUS_COMPLETE {
            all_complete = false;
        }
        if status != STATUS_NOT_STARTED {
            all_not_started = false;
        }
    }
    if !any || all_not_started {
        STATUS_NOT_STARTED.to_string()
    } else if all_complete {
        STATUS_COMPLETE.to_string()
    } else {
        STATUS_IN_PROGRESS.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stage_map(overrides: &[(&str, Value)]) -> FrontmatterMap {
        let mut m = FrontmatterMap::new();
        m.insert("id", Value::from("STAGE-1-1-1"));
        m.insert("ticket", Value::from("TICKET-1-1"));
        m.insert("epic", Value::from("EPIC-1"));
        m.insert("title", Value::from("Do the thing"));
        m.insert("status", Value::from("Not Started"));
        for (k, v) in overrides {
            m.insert(*k, v.clone());
        }
        m
    }

    #[test]
    fn kind_parses_from_id_shape() {
        assert_eq!(WorkItemId::from("EPIC-1").kind().unwrap(), WorkItemKind::Epic);
        assert_eq!(WorkItemId::from("TICKET-1-2").kind().unwrap(), WorkItemKind::Ticket);
        assert_eq!(WorkItemId::from("STAGE-1-2-3").kind().unwrap(), WorkItemKind::Stage);
        assert!(WorkItemId::from("BOGUS-1").kind().is_err());
    }

    #[test]
    fn parses_stage_defaults() {
        let m = stage_map(&[]);
        let stage = parse_stage(&PathBuf::from("x.md"), &m).unwrap();
        assert_eq!(stage.priority, 0);
        assert!(!stage.session_active);
        assert!(!stage.is_draft);
        assert!(stage.pending_merge_parents.is_empty());
    }

    #[test]
    fn parses_pending_merge_parents() {
        let m = stage_map(&[(
            "pending_merge_parents",
            Value::List(vec![Value::Map({
                let mut row = FrontmatterMap::new();
                row.insert("parent_stage_id", Value::from("STAGE-1-1-0"));
                row.insert("branch", Value::from("feat/base"));
                row
            })]),
        )]);
        let stage = parse_stage(&PathBuf::from("x.md"), &m).unwrap();
        assert_eq!(stage.pending_merge_parents.len(), 1);
        assert_eq!(stage.pending_merge_parents[0].parent_stage_id, "STAGE-1-1-0");
    }

    #[test]
    fn missing_required_field_errors() {
        let mut m = FrontmatterMap::new();
        m.insert("id", Value::from("STAGE-1-1-1"));
        assert!(parse_stage(&PathBuf::from("x.md"), &m).is_err());
    }

    #[test]
    fn derive_status_all_complete() {
        let statuses = ["Complete", "Complete"];
        assert_eq!(derive_status(statuses.into_iter()), "Complete");
    }

    #[test]
    fn derive_status_all_not_started() {
        let statuses = ["Not Started", "Not Started"];
        assert_eq!(derive_status(statuses.into_iter()), "Not Started");
    }

    #[test]
    fn derive_status_mixed_is_in_progress() {
        let statuses = ["Complete", "Build", "Not Started"];
        assert_eq!(derive_status(statuses.into_iter()), "In Progress");
    }

    #[test]
    fn derive_status_empty_is_not_started() {
        let statuses: Vec<&str> = vec![];
        assert_eq!(derive_status(statuses.into_iter()), "Not Started");
    }
}
