//! Job Manager - the in-process API over registry, queue and worker pool
//!
//! Owns every component's lifecycle: [`JobManager::start`] builds the
//! registry, queue, activity log and worker pool and spawns the prune loop;
//! [`JobManager::shutdown`] tears them down. Collaborators such as HTTP
//! handlers only ever talk to this type.

use crate::job::Job;
use crate::log::{ActivityEntry, ActivityKind, ActivityLog};
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::registry::{TaskCounts, TaskEvent, TaskRegistry, TaskUpdate, UpdateOutcome};
use crate::runner::{LocalProcessRunner, ProcessRunner};
use crate::task::{Metadata, Task, TaskId};
use mediaforge_foundation::{Error, QueueConfig, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Point-in-time summary of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting for a slot
    pub pending: usize,
    /// Jobs currently executing
    pub running: usize,
    pub max_concurrent: usize,
    /// Registry totals by status
    pub tasks: TaskCounts,
}

/// Background job manager
pub struct JobManager {
    config: QueueConfig,
    registry: Arc<TaskRegistry>,
    queue: Arc<JobQueue>,
    activity: Arc<ActivityLog>,
    pool: WorkerPool,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Build all components and spawn the workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: QueueConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(JobQueue::new(config.max_concurrent, Arc::clone(&registry)));
        let activity = Arc::new(ActivityLog::new(config.activity_log_capacity));
        let pool = WorkerPool::spawn(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&activity),
            runner,
            &config,
        );

        let pruner = config.prune_interval().map(|interval| {
            tokio::spawn(prune_loop(
                Arc::clone(&registry),
                Arc::clone(&activity),
                config.task_retention(),
                interval,
                pool.cancel_token(),
            ))
        });

        info!(
            max_concurrent = queue.max_concurrent(),
            process_timeout_secs = config.process_timeout_secs,
            "Job manager started"
        );

        Self {
            config,
            registry,
            queue,
            activity,
            pool,
            pruner: Mutex::new(pruner),
        }
    }

    /// Start with the child-process runner built from `config`
    pub fn with_local_runner(config: QueueConfig) -> Self {
        let runner = Arc::new(LocalProcessRunner::new(&config));
        Self::start(config, runner)
    }

    /// Allocate a new `Pending` task; never fails
    pub fn create_task(
        &self,
        task_type: impl Into<String>,
        description: impl Into<String>,
        metadata: Metadata,
    ) -> TaskId {
        let task_type = task_type.into();
        let description = description.into();
        let task_id = self
            .registry
            .create(task_type.clone(), description.clone(), metadata);

        self.activity.record(
            ActivityEntry::for_task(ActivityKind::Created, task_id, description)
                .with_metadata(json!({ "type": task_type })),
        );
        task_id
    }

    /// Enqueue a job bound to an existing task; returns immediately
    ///
    /// Fails with `NotFound` for an unknown task and `Validation` for a
    /// malformed command or a task that already finished.
    pub fn submit(
        &self,
        task_id: TaskId,
        command: Vec<String>,
        output_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let task = self.registry.get(task_id)?;
        if task.is_terminal() {
            return Err(Error::validation(format!(
                "task {} is already {}",
                task_id, task.status
            )));
        }

        let job = Job::new(task_id, command, output_path)?;
        let command = job.display_command();
        let position = self.queue.push_with(job, |position| {
            self.activity.record(
                ActivityEntry::for_task(ActivityKind::Queued, task_id, format!("Queued: {}", command))
                    .with_metadata(json!({ "position": position })),
            );
        })?;

        debug!(task_id = %task_id.short(), position, "Job submitted");
        Ok(())
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.registry.get(task_id)
    }

    /// Newest first, at most `limit`
    pub fn list_tasks(&self, limit: usize) -> Vec<Task> {
        self.registry.list(limit)
    }

    /// Direct update for in-process producers that do not go through the queue
    pub fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> UpdateOutcome {
        self.registry.update(task_id, update)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry.subscribe()
    }

    /// Resolve once the task is `Completed` or `Failed`
    ///
    /// Fails with `NotFound` for an unknown task and `Timeout` when `timeout`
    /// elapses first.
    pub async fn wait(&self, task_id: TaskId, timeout: Duration) -> Result<Task> {
        // subscribe before the first read so no transition slips between them
        let mut events = self.registry.subscribe();
        let task = self.registry.get(task_id)?;
        if task.is_terminal() {
            return Ok(task);
        }

        match tokio::time::timeout(timeout, self.watch_terminal(&mut events, task_id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "task {} did not finish within {:.1}s",
                task_id,
                timeout.as_secs_f64()
            ))),
        }
    }

    async fn watch_terminal(
        &self,
        events: &mut broadcast::Receiver<TaskEvent>,
        task_id: TaskId,
    ) -> Result<Task> {
        loop {
            match events.recv().await {
                Ok(TaskEvent { task }) if task.id == task_id && task.is_terminal() => {
                    return Ok(task);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(task_id = %task_id.short(), skipped, "Waiter lagged, re-reading task");
                    let task = self.registry.get(task_id)?;
                    if task.is_terminal() {
                        return Ok(task);
                    }
                }
                Err(RecvError::Closed) => return self.registry.get(task_id),
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.queue.pending_len(),
            running: self.queue.running(),
            max_concurrent: self.queue.max_concurrent(),
            tasks: self.registry.counts(),
        }
    }

    /// Up to `n` activity entries, newest first
    pub fn recent_activity(&self, n: usize) -> Vec<ActivityEntry> {
        self.activity.recent(n)
    }

    /// Remove tasks older than the configured retention now
    pub fn prune(&self) -> usize {
        prune_once(&self.registry, &self.activity, self.config.task_retention())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stop accepting work, fail pending jobs and wait for the workers
    ///
    /// Returns the number of pending jobs that were dropped.
    pub async fn shutdown(&self) -> usize {
        if let Some(pruner) = self.pruner.lock().take() {
            pruner.abort();
        }
        let dropped = self.pool.shutdown().await;
        info!(dropped, "Job manager stopped");
        dropped
    }
}

fn prune_once(registry: &TaskRegistry, activity: &ActivityLog, retention: Duration) -> usize {
    let removed = registry.prune(retention);
    if removed > 0 {
        activity.record(
            ActivityEntry::new(ActivityKind::Pruned, format!("Pruned {} tasks", removed))
                .with_metadata(json!({ "removed": removed })),
        );
    }
    removed
}

async fn prune_loop(
    registry: Arc<TaskRegistry>,
    activity: Arc<ActivityLog>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval(interval);
    // the first tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let removed = prune_once(&registry, &activity, retention);
                if removed > 0 {
                    debug!("Periodic prune: removed {} tasks", removed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::runner::{ProgressReporter, RunOutcome};
    use crate::state::TaskStatus;
    use crate::task::TaskOutput;
    use async_trait::async_trait;

    /// Succeeds after a short delay without touching the filesystem
    struct InstantRunner;

    #[async_trait]
    impl ProcessRunner for InstantRunner {
        async fn run(
            &self,
            job: &Job,
            reporter: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> RunOutcome {
            reporter.report(50, "Processing...");
            tokio::time::sleep(Duration::from_millis(10)).await;
            RunOutcome::Succeeded {
                output_path: job.output_path.clone(),
            }
        }

        fn name(&self) -> &'static str {
            "instant"
        }
    }

    fn manager() -> JobManager {
        JobManager::start(QueueConfig::default(), Arc::new(InstantRunner))
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let manager = manager();
        let id = manager.create_task("trim", "Trimming clip", Metadata::new());
        manager
            .submit(id, argv(&["ffmpeg", "-i", "a.mp4", "b.mp4"]), "/tmp/b.mp4")
            .unwrap();

        let task = manager.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result, Some(TaskOutput::render("/tmp/b.mp4")));

        let kinds: Vec<ActivityKind> = manager
            .recent_activity(10)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ActivityKind::Completed,
                ActivityKind::Started,
                ActivityKind::Queued,
                ActivityKind::Created
            ]
        );
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_activity_precedes_start() {
        let manager = manager();
        let ids: Vec<TaskId> = (0..20)
            .map(|i| {
                let id = manager.create_task("trim", format!("clip {}", i), Metadata::new());
                manager
                    .submit(id, argv(&["ffmpeg"]), format!("/tmp/clip{}.mp4", i))
                    .unwrap();
                id
            })
            .collect();

        for id in ids {
            manager.wait(id, Duration::from_secs(5)).await.unwrap();
            let kinds: Vec<ActivityKind> = manager
                .activity
                .for_task(id)
                .into_iter()
                .map(|e| e.kind)
                .collect();
            assert_eq!(
                kinds,
                vec![
                    ActivityKind::Created,
                    ActivityKind::Queued,
                    ActivityKind::Started,
                    ActivityKind::Completed
                ]
            );
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_errors() {
        let manager = manager();

        let err = manager
            .submit(TaskId::new(), argv(&["ffmpeg"]), "/tmp/x.mp4")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let id = manager.create_task("trim", "Trimming", Metadata::new());
        let err = manager.submit(id, Vec::new(), "/tmp/x.mp4").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(manager.get_task(id).unwrap().status, TaskStatus::Pending);

        manager.update_task(id, TaskUpdate::failed("gave up", "Cancelled"));
        let err = manager.submit(id, argv(&["ffmpeg"]), "/tmp/x.mp4").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let manager = manager();
        let id = manager.create_task("transcription", "Transcribing", Metadata::new());

        let err = manager
            .wait(id, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let err = manager
            .wait(TaskId::new(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_update_wakes_waiter() {
        let manager = Arc::new(manager());
        let id = manager.create_task("classification", "Classifying", Metadata::new());

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.update_task(
            id,
            TaskUpdate::completed(
                TaskOutput::Classification {
                    category: "speech".into(),
                    output_path: "/media/speech/a.wav".into(),
                },
                "Classified as speech",
            ),
        );

        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.message, "Classified as speech");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_and_prune() {
        let manager = manager();
        let done = manager.create_task("trim", "Trimming", Metadata::new());
        manager.create_task("trim", "Waiting", Metadata::new());
        manager.submit(done, argv(&["ffmpeg"]), "/tmp/done.mp4").unwrap();
        manager.wait(done, Duration::from_secs(5)).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.max_concurrent, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tasks.total, 2);
        assert_eq!(stats.tasks.completed, 1);
        assert_eq!(stats.tasks.pending, 1);

        manager.registry.backdate(done, chrono::Duration::days(30));
        assert_eq!(manager.prune(), 1);
        assert_eq!(manager.recent_activity(1)[0].kind, ActivityKind::Pruned);
        manager.shutdown().await;
    }
}
