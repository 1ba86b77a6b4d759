//! JSON-file-backed `TrackingStore`/`CommentStore`, matching
//! `sipag-core/src/worker/store.rs`'s `FileStateStore` JSON-file persistence
//! idiom rather than inventing a new on-disk format for these two small
//! external stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::{CommentStore, TrackingRow, TrackingStore};
use crate::workitem::WorkItemId;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackingRowRecord {
    id: String,
    child_stage_id: String,
    parent_stage_id: String,
    parent_branch: String,
    parent_pr_url: Option<String>,
    last_known_head: Option<String>,
    is_merged: bool,
    last_checked: Option<DateTime<Utc>>,
}

impl From<&TrackingRow> for TrackingRowRecord {
    fn from(r: &TrackingRow) -> Self {
        Self {
            id: r.id.clone(),
            child_stage_id: r.child_stage_id.as_str().to_string(),
            parent_stage_id: r.parent_stage_id.as_str().to_string(),
            parent_branch: r.parent_branch.clone(),
            parent_pr_url: r.parent_pr_url.clone(),
            last_known_head: r.last_known_head.clone(),
            is_merged: r.is_merged,
            last_checked: r.last_checked,
        }
    }
}

impl From<&TrackingRowRecord> for TrackingRow {
    fn from(r: &TrackingRowRecord) -> Self {
        Self {
            id: r.id.clone(),
            child_stage_id: WorkItemId::from(r.child_stage_id.clone()),
            parent_stage_id: WorkItemId::from(r.parent_stage_id.clone()),
            parent_branch: r.parent_branch.clone(),
            parent_pr_url: r.parent_pr_url.clone(),
            last_known_head: r.last_known_head.clone(),
            is_merged: r.is_merged,
            last_checked: r.last_checked,
        }
    }
}

/// JSON-file store for parent-branch tracking rows (§3, §4.9).
pub struct FileTrackingStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTrackingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<TrackingRowRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn save(&self, rows: &[TrackingRowRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = serde_json::to_string_pretty(rows)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

impl TrackingStore for FileTrackingStore {
    fn rows_for_child(&self, child_stage_id: &str) -> Result<Vec<TrackingRow>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .load()?
            .iter()
            .filter(|r| r.child_stage_id == child_stage_id)
            .map(TrackingRow::from)
            .collect())
    }

    fn all_rows(&self) -> Result<Vec<TrackingRow>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.iter().map(TrackingRow::from).collect())
    }

    fn update_row(&self, row: &TrackingRow) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut rows = self.load()?;
        let record = TrackingRowRecord::from(row);
        match rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = record,
            None => rows.push(record),
        }
        self.save(&rows)
    }
}

/// JSON-file store for the comment-poller watermark (§4.10).
pub struct FileCommentStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCommentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, i64>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, map: &HashMap<String, i64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(map)?)?;
        Ok(())
    }
}

impl CommentStore for FileCommentStore {
    fn last_seen_count(&self, stage_id: &str) -> Result<i64> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.get(stage_id).copied().unwrap_or(0))
    }

    fn set_last_seen_count(&self, stage_id: &str, count: i64) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        map.insert(stage_id.to_string(), count);
        self.save(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tracking_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileTrackingStore::new(dir.path().join("tracking.json"));
        let row = TrackingRow {
            id: "row-1".to_string(),
            child_stage_id: WorkItemId::from("STAGE-1-1-1"),
            parent_stage_id: WorkItemId::from("STAGE-1-1-0"),
            parent_branch: "feat/base".to_string(),
            parent_pr_url: None,
            last_known_head: None,
            is_merged: false,
            last_checked: None,
        };
        store.update_row(&row).unwrap();
        let rows = store.rows_for_child("STAGE-1-1-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_merged);

        let mut merged = row.clone();
        merged.is_merged = true;
        store.update_row(&merged).unwrap();
        let rows = store.rows_for_child("STAGE-1-1-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_merged);
    }

    #[test]
    fn comment_store_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let store = FileCommentStore::new(dir.path().join("comments.json"));
        assert_eq!(store.last_seen_count("STAGE-1-1-1").unwrap(), 0);
        store.set_last_seen_count("STAGE-1-1-1", 3).unwrap();
        assert_eq!(store.last_seen_count("STAGE-1-1-1").unwrap(), 3);
    }
}
