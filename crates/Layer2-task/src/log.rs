//! Activity Log - bounded history of queue milestones
//!
//! A fixed-capacity ring of [`ActivityEntry`] records: tasks created, jobs
//! queued, started, finished, dropped at shutdown, and prune sweeps. Oldest
//! entries are evicted first.

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of entries kept
pub const DEFAULT_CAPACITY: usize = 100;

/// Kind of milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Created,
    Queued,
    Started,
    Completed,
    Failed,
    Dropped,
    Pruned,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Created => "created",
            ActivityKind::Queued => "queued",
            ActivityKind::Started => "started",
            ActivityKind::Completed => "completed",
            ActivityKind::Failed => "failed",
            ActivityKind::Dropped => "dropped",
            ActivityKind::Pruned => "pruned",
        }
    }
}

/// A single activity record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub kind: ActivityKind,

    pub message: String,

    /// Absent for queue-wide events such as pruning
    pub task_id: Option<TaskId>,

    pub timestamp: DateTime<Utc>,

    /// Associated details (exit status, counts, ...)
    pub metadata: Option<serde_json::Value>,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task_id: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn for_task(kind: ActivityKind, task_id: TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::new(kind, message)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Thread-safe ring buffer of activity entries
#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, entry: ActivityEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `n` entries, newest first
    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    /// Entries concerning one task, oldest first
    pub fn for_task(&self, task_id: TaskId) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
