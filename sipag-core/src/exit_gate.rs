//! Exit Gate (§4.7): propagate a stage's status change up to its ticket,
//! then its epic, then trigger the repo resync hook.
//!
//! Grounded on `sipag-core/src/task/aggregate.rs`'s "derive a parent's
//! rollup status from its children's statuses" shape, and
//! `sipag-core/src/repository.rs::transition`'s "write through the
//! repository, log on failure, never roll back" posture.

use std::path::Path;

use anyhow::{Context, Result};

use crate::frontmatter::{self, Value};
use crate::ports::SyncHook;
use crate::workitem::{self, WorkItemId};

/// Invoked only when the post-worker status differs from the pre-worker
/// status (§4.7). Exit-gate failures never roll back worker progress and
/// never block the slot release — every step logs and proceeds.
pub fn run(
    stage_id: &WorkItemId,
    new_status: &str,
    repo_root: &Path,
    id_to_path: impl Fn(&WorkItemId) -> Option<std::path::PathBuf>,
    sync_hook: &dyn SyncHook,
) -> Result<()> {
    let stage_path = id_to_path(stage_id)
        .with_context(|| format!("exit gate: no file path known for {stage_id}"))?;
    let stage_doc = frontmatter::read(&stage_path)?;
    let ticket_id: WorkItemId = stage_doc
        .data
        .get_str("ticket")
        .with_context(|| format!("exit gate: stage {stage_id} missing `ticket`"))?
        .into();
    let epic_id: WorkItemId = stage_doc
        .data
        .get_str("epic")
        .with_context(|| format!("exit gate: stage {stage_id} missing `epic`"))?
        .into();

    let ticket_path = id_to_path(&ticket_id)
        .with_context(|| format!("exit gate: no file path known for ticket {ticket_id}"))?;
    let ticket_changed = update_ticket(&ticket_path, stage_id, new_status)?;

    if ticket_changed {
        if let Some(epic_path) = id_to_path(&epic_id) {
            let new_ticket_status = workitem::read_ticket(&ticket_path)?.status;
            if let Err(e) = update_epic(&epic_path, &ticket_id, &new_ticket_status) {
                tracing::error!(epic = %epic_id, error = %e, "exit gate: failed to update epic, continuing");
            }
        } else {
            tracing::error!(epic = %epic_id, "exit gate: no file path known for epic, skipping epic update");
        }
    }

    match sync_hook.sync(repo_root) {
        Ok(()) => {}
        Err(first_err) => {
            tracing::warn!(error = %first_err, "exit gate: sync failed, retrying once");
            if let Err(second_err) = sync_hook.sync(repo_root) {
                tracing::error!(error = %second_err, "exit gate: sync failed twice, giving up (best-effort propagation)");
            }
        }
    }

    Ok(())
}

/// Sets `stage_statuses[stage_id] = new_status` on the ticket, recomputes
/// its derived status, and writes back. Returns whether the ticket's
/// derived status changed.
fn update_ticket(ticket_path: &Path, stage_id: &WorkItemId, new_status: &str) -> Result<bool> {
    let mut doc = frontmatter::read(ticket_path)?;

    let mut stage_statuses = doc
        .data
        .get("stage_statuses")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    stage_statuses.insert(stage_id.as_str(), Value::from(new_status));
    doc.data.insert("stage_statuses", Value::Map(stage_statuses.clone()));

    let statuses: Vec<&str> = stage_statuses
        .iter()
        .filter_map(|(_, v)| v.as_str())
        .collect();
    let derived = workitem::derive_status(statuses.into_iter());

    let old_status = doc.data.get_str("status").unwrap_or_default().to_string();
    let changed = old_status != derived;
    doc.data.insert("status", Value::from(derived));

    frontmatter::write(ticket_path, &doc.data, &doc.body)?;
    Ok(changed)
}

/// Sets `ticket_statuses[ticket_id] = ticket_status` on the epic, recomputes
/// its derived status, and writes back.
fn update_epic(epic_path: &Path, ticket_id: &WorkItemId, ticket_status: &str) -> Result<()> {
    let mut doc = frontmatter::read(epic_path)?;

    let mut ticket_statuses = doc
        .data
        .get("ticket_statuses")
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    ticket_statuses.insert(ticket_id.as_str(), Value::from(ticket_status));
    doc.data.insert("ticket_statuses", Value::Map(ticket_statuses.clone()));

    let statuses: Vec<&str> = ticket_statuses
        .iter()
        .filter_map(|(_, v)| v.as_str())
        .collect();
    let derived = workitem::derive_status(statuses.into_iter());
    doc.data.insert("status", Value::from(derived));

    frontmatter::write(epic_path, &doc.data, &doc.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct FakeSync {
        fail_times: Cell<u32>,
    }
    impl SyncHook for FakeSync {
        fn sync(&self, _repo_path: &Path) -> Result<()> {
            let remaining = self.fail_times.get();
            if remaining > 0 {
                self.fail_times.set(remaining - 1);
                anyhow::bail!("sync unavailable");
            }
            Ok(())
        }
    }

    fn setup() -> (TempDir, std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let stage_path = dir.path().join("stage.md");
        let ticket_path = dir.path().join("ticket.md");
        let epic_path = dir.path().join("epic.md");
        std::fs::write(
            &stage_path,
            "---\nid: STAGE-1-1-1\nticket: TICKET-1-1\nepic: EPIC-1\ntitle: t\nstatus: Build\n---\n",
        )
        .unwrap();
        std::fs::write(
            &ticket_path,
            "---\nid: TICKET-1-1\nepic: EPIC-1\ntitle: t\nstatus: Not Started\nstage_statuses:\n  STAGE-1-1-1: Design\n  STAGE-1-1-2: Not Started\n---\n",
        )
        .unwrap();
        std::fs::write(
            &epic_path,
            "---\nid: EPIC-1\ntitle: t\nstatus: Not Started\nticket_statuses:\n  TICKET-1-1: Not Started\n---\n",
        )
        .unwrap();
        (dir, stage_path, ticket_path, epic_path)
    }

    #[test]
    fn propagates_stage_through_ticket_and_epic() {
        let (_dir, stage_path, ticket_path, epic_path) = setup();
        let sync = FakeSync {
            fail_times: Cell::new(0),
        };
        let paths = [
            ("STAGE-1-1-1", stage_path.clone()),
            ("TICKET-1-1", ticket_path.clone()),
            ("EPIC-1", epic_path.clone()),
        ];
        run(
            &WorkItemId::from("STAGE-1-1-1"),
            "Build",
            stage_path.parent().unwrap(),
            |id| {
                paths
                    .iter()
                    .find(|(k, _)| *k == id.as_str())
                    .map(|(_, p)| p.clone())
            },
            &sync,
        )
        .unwrap();

        let ticket = workitem::read_ticket(&ticket_path).unwrap();
        assert_eq!(ticket.stage_statuses["STAGE-1-1-1"], "Build");
        assert_eq!(ticket.status, "In Progress");

        let epic = workitem::read_epic(&epic_path).unwrap();
        assert_eq!(epic.ticket_statuses["TICKET-1-1"], "In Progress");
        assert_eq!(epic.status, "In Progress");
    }

    #[test]
    fn epic_untouched_when_ticket_status_unchanged() {
        let (_dir, stage_path, ticket_path, epic_path) = setup();
        // Pre-set ticket to already be In Progress with two non-matching statuses,
        // so flipping STAGE-1-1-1 to Build keeps the derived status the same.
        let mut doc = frontmatter::read(&ticket_path).unwrap();
        doc.data.insert("status", Value::from("In Progress"));
        let mut ss = doc.data.get("stage_statuses").and_then(Value::as_map).cloned().unwrap();
        ss.insert("STAGE-1-1-1", Value::from("Build"));
        doc.data.insert("stage_statuses", Value::Map(ss));
        frontmatter::write(&ticket_path, &doc.data, &doc.body).unwrap();
        let epic_before = std::fs::read_to_string(&epic_path).unwrap();

        let sync = FakeSync { fail_times: Cell::new(0) };
        let paths = [
            ("STAGE-1-1-1", stage_path.clone()),
            ("TICKET-1-1", ticket_path.clone()),
            ("EPIC-1", epic_path.clone()),
        ];
        run(
            &WorkItemId::from("STAGE-1-1-1"),
            "Build",
            stage_path.parent().unwrap(),
            |id| paths.iter().find(|(k, _)| *k == id.as_str()).map(|(_, p)| p.clone()),
            &sync,
        )
        .unwrap();

        let epic_after = std::fs::read_to_string(&epic_path).unwrap();
        assert_eq!(epic_before, epic_after);
    }

    #[test]
    fn sync_retried_once_then_gives_up_without_erroring() {
        let (_dir, stage_path, ticket_path, epic_path) = setup();
        let sync = FakeSync { fail_times: Cell::new(2) };
        let paths = [
            ("STAGE-1-1-1", stage_path.clone()),
            ("TICKET-1-1", ticket_path.clone()),
            ("EPIC-1", epic_path.clone()),
        ];
        // Should not propagate the sync failure as an error (best-effort).
        run(
            &WorkItemId::from("STAGE-1-1-1"),
            "Build",
            stage_path.parent().unwrap(),
            |id| paths.iter().find(|(k, _)| *k == id.as_str()).map(|(_, p)| p.clone()),
            &sync,
        )
        .unwrap();
    }
}
