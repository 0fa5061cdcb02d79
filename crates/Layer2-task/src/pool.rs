//! Worker Pool - fixed set of execution slots draining the job queue
//!
//! Each worker repeatedly takes a [`Dispatch`] from the [`JobQueue`], marks
//! the bound task `Running`, hands the job to the [`ProcessRunner`] and
//! folds the outcome back into the registry. A panic inside one job is
//! caught at the worker boundary and recorded as a task failure; the worker
//! keeps serving.
//!
//! Shutdown closes the queue, fails every job that never started, signals
//! the shared [`CancellationToken`] and waits for the workers to return.

use crate::job::Job;
use crate::log::{ActivityEntry, ActivityKind, ActivityLog};
use crate::queue::{Dispatch, JobQueue};
use crate::registry::{TaskRegistry, TaskUpdate, UpdateOutcome};
use crate::runner::{ProcessRunner, ProgressReporter, RunOutcome};
use crate::task::{TaskId, TaskOutput};
use futures::FutureExt;
use mediaforge_foundation::QueueConfig;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error recorded on jobs still pending at shutdown
pub const DROPPED_ERROR: &str = "job dropped: worker pool shut down";

/// Keep the last `max` characters of `text`
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        text.chars().skip(count - max).collect()
    }
}

/// Keep the first `max` characters of `text`
pub fn head_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State shared by every worker
struct WorkerContext {
    queue: Arc<JobQueue>,
    registry: Arc<TaskRegistry>,
    activity: Arc<ActivityLog>,
    runner: Arc<dyn ProcessRunner>,
    error_max_len: usize,
    message_max_len: usize,
}

impl WorkerContext {
    async fn serve(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "Worker started");

        while let Some(dispatch) = self.queue.next(&cancel).await {
            let task_id = dispatch.job.task_id;
            let run = AssertUnwindSafe(self.execute(worker, &dispatch, &cancel));

            if let Err(panic) = run.catch_unwind().await {
                let reason = panic_message(panic.as_ref());
                error!(worker, task_id = %task_id.short(), "Job panicked: {}", reason);
                self.fail(
                    task_id,
                    format!("internal error: {}", reason),
                    "Internal error",
                );
            }
        }

        debug!(worker, "Worker stopped");
    }

    async fn execute(&self, worker: usize, dispatch: &Dispatch, cancel: &CancellationToken) {
        let job = &dispatch.job;
        let task_id = job.task_id;

        let outcome = self
            .registry
            .update(task_id, TaskUpdate::running(10, "Starting process..."));
        if !outcome.is_applied() {
            // pruned, or finished by another producer while queued
            warn!(worker, task_id = %task_id.short(), ?outcome, "Skipping job for unavailable task");
            return;
        }

        info!(worker, task_id = %task_id.short(), runner = self.runner.name(), "Job started");
        self.activity.record(ActivityEntry::for_task(
            ActivityKind::Started,
            task_id,
            format!("Started: {}", job.display_command()),
        ));

        let reporter = ProgressReporter::new(Arc::clone(&self.registry), task_id);
        let started = Instant::now();
        let outcome = self.runner.run(job, &reporter, cancel).await;
        let elapsed_ms = millis(started.elapsed());

        match outcome {
            RunOutcome::Succeeded { output_path } => {
                info!(worker, task_id = %task_id.short(), elapsed_ms, "Job completed");
                self.activity.record(
                    ActivityEntry::for_task(
                        ActivityKind::Completed,
                        task_id,
                        format!("Completed: {}", output_path.display()),
                    )
                    .with_metadata(json!({ "elapsed_ms": elapsed_ms })),
                );
                self.registry.update(
                    task_id,
                    TaskUpdate::completed(TaskOutput::render(output_path), "Processing completed"),
                );
            }
            failed => {
                let raw = failed.error_text().unwrap_or_default();
                warn!(worker, task_id = %task_id.short(), elapsed_ms, "Job failed: {}", head_chars(&raw, self.message_max_len));
                if let RunOutcome::Failed { kind, .. } = &failed {
                    self.activity.record(
                        ActivityEntry::for_task(ActivityKind::Failed, task_id, kind.describe())
                            .with_metadata(json!({ "elapsed_ms": elapsed_ms })),
                    );
                }
                self.fail_with_output(task_id, &raw);
            }
        }
    }

    /// Record a process failure: bounded error, short message
    fn fail_with_output(&self, task_id: TaskId, raw: &str) {
        let error = tail_chars(raw, self.error_max_len);
        let message = format!("Process failed: {}", head_chars(&error, self.message_max_len));
        self.fail(task_id, error, message);
    }

    fn fail(&self, task_id: TaskId, error: String, message: impl Into<String>) -> UpdateOutcome {
        self.registry
            .update(task_id, TaskUpdate::failed(error, message))
    }
}

/// Fixed-size pool of workers bound to one queue
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn one worker per concurrency slot of `queue`
    pub fn spawn(
        queue: Arc<JobQueue>,
        registry: Arc<TaskRegistry>,
        activity: Arc<ActivityLog>,
        runner: Arc<dyn ProcessRunner>,
        config: &QueueConfig,
    ) -> Self {
        let size = queue.max_concurrent();
        let context = Arc::new(WorkerContext {
            queue,
            registry,
            activity,
            runner,
            error_max_len: config.error_max_len.max(1),
            message_max_len: config.message_max_len,
        });
        let cancel = CancellationToken::new();

        let workers = (0..size)
            .map(|worker| tokio::spawn(Arc::clone(&context).serve(worker, cancel.clone())))
            .collect();

        info!(workers = size, runner = context.runner.name(), "Worker pool started");

        Self {
            context,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    pub fn size(&self) -> usize {
        self.context.queue.max_concurrent()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the pool shuts down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the pool; returns the number of pending jobs dropped
    ///
    /// In-flight jobs are signalled and given the runner's grace period.
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> usize {
        self.context.queue.close();

        let dropped = self.context.queue.drain();
        let count = dropped.len();
        for job in dropped {
            self.drop_job(job);
        }

        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }

        info!(dropped = count, "Worker pool shut down");
        count
    }

    fn drop_job(&self, job: Job) {
        let task_id = job.task_id;
        debug!(task_id = %task_id.short(), "Dropping pending job");
        self.context.activity.record(ActivityEntry::for_task(
            ActivityKind::Dropped,
            task_id,
            DROPPED_ERROR,
        ));
        self.context
            .fail(task_id, DROPPED_ERROR.to_string(), "Job dropped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.context.queue.close();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;
    use crate::task::Metadata;
    use async_trait::async_trait;

    struct PanickingRunner;

    #[async_trait]
    impl ProcessRunner for PanickingRunner {
        async fn run(
            &self,
            job: &Job,
            _reporter: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> RunOutcome {
            if job.program() == "panic" {
                panic!("runner exploded");
            }
            RunOutcome::Succeeded {
                output_path: job.output_path.clone(),
            }
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    /// Blocks until cancelled
    struct BlockingRunner;

    #[async_trait]
    impl ProcessRunner for BlockingRunner {
        async fn run(
            &self,
            _job: &Job,
            _reporter: &ProgressReporter,
            cancel: &CancellationToken,
        ) -> RunOutcome {
            cancel.cancelled().await;
            RunOutcome::failed(crate::runner::FailureKind::Cancelled, "")
        }

        fn name(&self) -> &'static str {
            "blocking"
        }
    }

    struct Harness {
        registry: Arc<TaskRegistry>,
        queue: Arc<JobQueue>,
        activity: Arc<ActivityLog>,
        pool: WorkerPool,
    }

    fn harness(max_concurrent: usize, runner: Arc<dyn ProcessRunner>) -> Harness {
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(JobQueue::new(max_concurrent, Arc::clone(&registry)));
        let activity = Arc::new(ActivityLog::default());
        let pool = WorkerPool::spawn(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&activity),
            runner,
            &QueueConfig::default(),
        );
        Harness {
            registry,
            queue,
            activity,
            pool,
        }
    }

    fn submit(h: &Harness, program: &str) -> TaskId {
        let id = h.registry.create("render", "Rendering", Metadata::new());
        let job = Job::new(id, vec![program.to_string()], "/tmp/out.mp4").unwrap();
        h.queue.push(job).unwrap();
        id
    }

    async fn wait_terminal(registry: &TaskRegistry, id: TaskId) -> crate::task::Task {
        for _ in 0..200 {
            let task = registry.get(id).unwrap();
            if task.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", id);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("short", 10), "short");
        assert_eq!(head_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn test_elapsed_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_one_job() {
        let h = harness(1, Arc::new(PanickingRunner));
        let bad = submit(&h, "panic");
        let good = submit(&h, "ffmpeg");

        let bad = wait_terminal(&h.registry, bad).await;
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("internal error: runner exploded"));

        let good = wait_terminal(&h.registry, good).await;
        assert_eq!(good.status, TaskStatus::Completed);
        assert_eq!(good.progress, 100);
        assert_eq!(good.message, "Processing completed");

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_and_cancels_running() {
        let h = harness(1, Arc::new(BlockingRunner));
        let running = submit(&h, "ffmpeg");
        let pending = submit(&h, "ffmpeg");

        // wait for the first job to occupy the only slot
        for _ in 0..200 {
            if h.registry.get(running).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let dropped = h.pool.shutdown().await;
        assert_eq!(dropped, 1);
        assert!(h.pool.is_shut_down());

        let pending = h.registry.get(pending).unwrap();
        assert_eq!(pending.status, TaskStatus::Failed);
        assert_eq!(pending.error.as_deref(), Some(DROPPED_ERROR));

        let running = h.registry.get(running).unwrap();
        assert_eq!(running.status, TaskStatus::Failed);
        assert!(running.message.starts_with("Process failed: "));

        let kinds: Vec<ActivityKind> = h.activity.recent(10).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ActivityKind::Dropped));
        assert_eq!(kinds[0], ActivityKind::Failed);
        assert_eq!(h.pool.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_skips_job_for_terminal_task() {
        let h = harness(1, Arc::new(PanickingRunner));
        let id = h.registry.create("render", "Rendering", Metadata::new());
        h.registry
            .update(id, TaskUpdate::failed("cancelled by caller", "Cancelled"));

        let job = Job::new(id, vec!["panic".to_string()], "/tmp/out.mp4").unwrap();
        h.queue.push(job).unwrap();
        let follow_up = submit(&h, "ffmpeg");
        wait_terminal(&h.registry, follow_up).await;

        let task = h.registry.get(id).unwrap();
        assert_eq!(task.error.as_deref(), Some("cancelled by caller"));
        h.pool.shutdown().await;
    }
}
