//! Task Registry - the authoritative in-memory store of task state
//!
//! All mutation goes through [`TaskRegistry::update`], which applies a
//! [`TaskUpdate`] under a single write lock so a status write and a progress
//! write issued from different call sites can never interleave.
//!
//! Every applied change is published as a [`TaskEvent`] snapshot on a
//! broadcast channel; slow subscribers lag and lose events rather than
//! blocking writers.

use crate::state::TaskStatus;
use crate::task::{Metadata, Task, TaskId, TaskOutput};
use chrono::Utc;
use mediaforge_foundation::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Broadcast channel capacity
const EVENT_CAPACITY: usize = 1024;

/// Snapshot of a task right after a change was applied
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task: Task,
}

/// Partial update; only the fields that are set are applied
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// Clamped into 0..=100 on apply
    pub progress: Option<i64>,
    /// Ignored when empty
    pub message: Option<String>,
    /// Kept only when the task ends up `Completed`
    pub result: Option<TaskOutput>,
    /// A non-empty error forces `Failed`
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: i64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn result(mut self, result: TaskOutput) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// `Running` with a progress value and status text
    pub fn running(progress: i64, message: impl Into<String>) -> Self {
        Self::new()
            .status(TaskStatus::Running)
            .progress(progress)
            .message(message)
    }

    /// `Completed` at 100% with a result
    pub fn completed(result: TaskOutput, message: impl Into<String>) -> Self {
        Self::new()
            .status(TaskStatus::Completed)
            .progress(100)
            .message(message)
            .result(result)
    }

    /// `Failed` with an error
    pub fn failed(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new()
            .status(TaskStatus::Failed)
            .message(message)
            .error(error)
    }

    fn effective_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Status the task will have after this update, if it changes
    fn target_status(&self) -> Option<TaskStatus> {
        if self.effective_error().is_some() {
            Some(TaskStatus::Failed)
        } else {
            self.status
        }
    }
}

/// What happened to an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// No task with that id (never created, or pruned)
    UnknownTask,
    /// The task already reached `Completed` or `Failed`
    Terminal,
    /// The requested status is not a legal successor
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Per-status task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

struct Entry {
    /// Creation order; breaks ties between equal timestamps
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    next_seq: u64,
}

/// In-memory task store shared by the queue, the workers and callers
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Allocate a new `Pending` task
    pub fn create(
        &self,
        task_type: impl Into<String>,
        description: impl Into<String>,
        metadata: Metadata,
    ) -> TaskId {
        let task = Task::new(task_type, description, metadata);
        let task_id = task.id;

        {
            let mut inner = self.inner.write();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.tasks.insert(
                task_id,
                Entry {
                    seq,
                    task: task.clone(),
                },
            );
        }

        debug!(task_id = %task_id.short(), task_type = %task.task_type, "Task created");
        self.publish(task);
        task_id
    }

    /// Apply `update` atomically
    ///
    /// Unknown ids, terminal tasks and illegal transitions are reported
    /// through [`UpdateOutcome`] and leave the registry untouched.
    pub fn update(&self, task_id: TaskId, update: TaskUpdate) -> UpdateOutcome {
        let snapshot = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.tasks.get_mut(&task_id) else {
                debug!(task_id = %task_id.short(), "Update for unknown task ignored");
                return UpdateOutcome::UnknownTask;
            };
            let task = &mut entry.task;

            if task.status.is_terminal() {
                debug!(
                    task_id = %task_id.short(),
                    status = %task.status,
                    "Update for terminal task rejected"
                );
                return UpdateOutcome::Terminal;
            }

            let target = update.target_status();
            if let Some(to) = target {
                if !task.status.can_transition_to(to) {
                    warn!(
                        task_id = %task_id.short(),
                        from = %task.status,
                        to = %to,
                        "Illegal status transition rejected"
                    );
                    return UpdateOutcome::InvalidTransition {
                        from: task.status,
                        to,
                    };
                }
                task.status = to;
            }

            if let Some(progress) = update.progress {
                task.progress = progress.clamp(0, 100) as u8;
            }

            if let Some(message) = update.message.filter(|m| !m.is_empty()) {
                task.message = message;
            }

            if let Some(error) = update.error.filter(|e| !e.is_empty()) {
                task.error = Some(error);
            }

            if let Some(result) = update.result {
                if task.status == TaskStatus::Completed {
                    task.result = Some(result);
                } else {
                    debug!(task_id = %task_id.short(), "Result dropped: task not completed");
                }
            }

            task.updated_at = Utc::now();
            task.clone()
        };

        self.publish(snapshot);
        UpdateOutcome::Applied
    }

    pub fn get(&self, task_id: TaskId) -> Result<Task> {
        self.inner
            .read()
            .tasks
            .get(&task_id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.inner.read().tasks.contains_key(&task_id)
    }

    /// Newest-created first, at most `limit` tasks
    pub fn list(&self, limit: usize) -> Vec<Task> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.tasks.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Remove tasks created more than `max_age` ago; returns how many
    pub fn prune(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut inner = self.inner.write();
        let before = inner.tasks.len();
        inner.tasks.retain(|_, entry| entry.task.created_at >= cutoff);
        let removed = before - inner.tasks.len();

        if removed > 0 {
            debug!("Pruned {} tasks older than {:?}", removed, max_age);
        }
        removed
    }

    pub fn counts(&self) -> TaskCounts {
        let inner = self.inner.read();
        let mut counts = TaskCounts {
            total: inner.tasks.len(),
            ..Default::default()
        };
        for entry in inner.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive a snapshot after every applied change
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, task: Task) {
        // no subscribers is fine
        let _ = self.events.send(TaskEvent { task });
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, task_id: TaskId, by: chrono::Duration) {
        if let Some(entry) = self.inner.write().tasks.get_mut(&task_id) {
            entry.task.created_at = entry.task.created_at - by;
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
