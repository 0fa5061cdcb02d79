//! Process Runner - executes one external command and classifies the outcome
//!
//! The [`ProcessRunner`] trait is the seam between the worker pool and the
//! operating system. [`LocalProcessRunner`] is the production implementation:
//! it spawns the argument vector directly (no shell), keeps a rolling tail of
//! stderr, enforces the configured timeout and honours pool shutdown with a
//! grace period before killing the child.
//!
//! Success means exit code zero AND the expected output path exists.
//! Everything else, including a failure to spawn, is a [`RunOutcome::Failed`].

use crate::job::Job;
use crate::registry::{TaskRegistry, TaskUpdate, UpdateOutcome};
use crate::task::TaskId;
use async_trait::async_trait;
use mediaforge_foundation::QueueConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to keep reading stderr after the child is gone
///
/// A grandchild that inherited the pipe can hold it open indefinitely.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Longest stderr line kept; the rest of an overlong line is discarded
const STDERR_LINE_MAX: usize = 4096;

/// Progress handle given to a runner for the task it is executing
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
}

impl ProgressReporter {
    pub fn new(registry: Arc<TaskRegistry>, task_id: TaskId) -> Self {
        Self { registry, task_id }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Record intermediate progress; the task stays `Running`
    pub fn report(&self, progress: i64, message: impl Into<String>) -> UpdateOutcome {
        self.registry
            .update(self.task_id, TaskUpdate::running(progress, message))
    }
}

/// Why a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Could not create the output directory or start the program
    Spawn(String),
    /// Non-zero exit; `None` when terminated by a signal
    Exit(Option<i32>),
    /// Zero exit but the expected artifact is absent
    MissingOutput(PathBuf),
    /// Killed after exceeding the process timeout
    TimedOut(Duration),
    /// Killed after the shutdown grace period
    Cancelled,
}

impl FailureKind {
    pub fn describe(&self) -> String {
        match self {
            FailureKind::Spawn(reason) => format!("failed to start process: {}", reason),
            FailureKind::Exit(Some(code)) => format!("process exited with code {}", code),
            FailureKind::Exit(None) => "process terminated by signal".to_string(),
            FailureKind::MissingOutput(path) => {
                format!("expected output not found: {}", path.display())
            }
            FailureKind::TimedOut(limit) => {
                format!("process timed out after {}s", limit.as_secs())
            }
            FailureKind::Cancelled => "process cancelled: worker pool shut down".to_string(),
        }
    }
}

/// Classified result of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { output_path: PathBuf },
    Failed { kind: FailureKind, stderr: String },
}

impl RunOutcome {
    pub fn failed(kind: FailureKind, stderr: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            stderr: stderr.into(),
        }
    }

    /// Text recorded as the task error
    ///
    /// A plain non-zero exit reports stderr alone. Other failures append
    /// their description after stderr so it survives tail truncation.
    pub fn error_text(&self) -> Option<String> {
        let RunOutcome::Failed { kind, stderr } = self else {
            return None;
        };
        let stderr = stderr.trim();
        Some(match kind {
            _ if stderr.is_empty() => kind.describe(),
            FailureKind::Exit(_) => stderr.to_string(),
            _ => format!("{}\n{}", stderr, kind.describe()),
        })
    }
}

/// Executes a job to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `job`; must return once the process is gone, never panic on
    /// ordinary process failures
    async fn run(
        &self,
        job: &Job,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> RunOutcome;

    fn name(&self) -> &'static str;
}

/// Timeout policy for one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Wait indefinitely
    None,
    /// Kill when exceeded
    Hard(Duration),
}

impl TimeoutPolicy {
    pub fn hard_secs(secs: u64) -> Self {
        Self::Hard(Duration::from_secs(secs))
    }

    pub fn max_duration(&self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Hard(d) => Some(*d),
        }
    }
}

impl From<Option<Duration>> for TimeoutPolicy {
    fn from(limit: Option<Duration>) -> Self {
        limit.map_or(Self::None, Self::Hard)
    }
}

/// Runs jobs as child processes of this one
#[derive(Debug, Clone)]
pub struct LocalProcessRunner {
    timeout: TimeoutPolicy,
    grace: Duration,
    stderr_max_lines: usize,
}

impl LocalProcessRunner {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            timeout: config.process_timeout().into(),
            grace: config.shutdown_grace(),
            stderr_max_lines: config.stderr_max_lines.max(1),
        }
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn timeout(&self) -> TimeoutPolicy {
        self.timeout
    }
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Rolling window over the last lines written to stderr
#[derive(Debug)]
struct StderrTail {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl StderrTail {
    fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines),
            max_lines,
        }
    }

    /// Undecodable bytes become U+FFFD; blank lines are skipped
    fn push(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Read stderr until EOF, splitting on `\n` and on `\r`
///
/// Progress output rewrites one line with `\r`, so both count as breaks.
/// The pipe stays open until EOF whatever the bytes are.
async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        let consumed = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(buf) => match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    extend_capped(&mut line, &buf[..end]);
                    tail.lock().push(&line);
                    line.clear();
                    end + 1
                }
                None => {
                    extend_capped(&mut line, buf);
                    buf.len()
                }
            },
            Err(e) => {
                debug!("stderr read failed: {}", e);
                break;
            }
        };
        reader.consume(consumed);
    }

    tail.lock().push(&line);
}

fn extend_capped(line: &mut Vec<u8>, bytes: &[u8]) {
    let room = STDERR_LINE_MAX.saturating_sub(line.len());
    line.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(
        &self,
        job: &Job,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let task_id = job.task_id.short();

        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return RunOutcome::failed(
                    FailureKind::Spawn(format!(
                        "cannot create output directory {}: {}",
                        parent.display(),
                        e
                    )),
                    "",
                );
            }
        }

        let mut cmd = Command::new(job.program());
        cmd.args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task_id = %task_id, command = %job.display_command(), "Spawning process");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task_id, program = %job.program(), "Spawn failed: {}", e);
                return RunOutcome::failed(FailureKind::Spawn(e.to_string()), "");
            }
        };

        reporter.report(50, "Processing...");

        let tail = Arc::new(Mutex::new(StderrTail::new(self.stderr_max_lines)));
        let mut reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, Arc::clone(&tail))));

        let limit = self.timeout.max_duration();
        let waited = tokio::select! {
            status = child.wait() => status.map_err(|e| FailureKind::Spawn(e.to_string())),
            _ = deadline(limit) => {
                let limit = limit.unwrap_or_default();
                warn!(task_id = %task_id, "Process timed out after {:.1}s, killing", limit.as_secs_f64());
                let _ = child.kill().await;
                Err(FailureKind::TimedOut(limit))
            }
            _ = cancel.cancelled() => {
                debug!(task_id = %task_id, grace_secs = self.grace.as_secs(), "Shutdown requested, waiting for process");
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(status) => status.map_err(|e| FailureKind::Spawn(e.to_string())),
                    Err(_) => {
                        warn!(task_id = %task_id, "Grace period expired, killing process");
                        let _ = child.kill().await;
                        Err(FailureKind::Cancelled)
                    }
                }
            }
        };

        if let Some(handle) = reader.as_mut() {
            if tokio::time::timeout(STDERR_DRAIN, &mut *handle).await.is_err() {
                handle.abort();
            }
        }
        let stderr = tail.lock().joined();

        let status = match waited {
            Ok(status) => status,
            Err(kind) => return RunOutcome::failed(kind, stderr),
        };

        if !status.success() {
            debug!(task_id = %task_id, exit_code = ?status.code(), "Process exited unsuccessfully");
            return RunOutcome::failed(FailureKind::Exit(status.code()), stderr);
        }

        match tokio::fs::try_exists(&job.output_path).await {
            Ok(true) => RunOutcome::Succeeded {
                output_path: job.output_path.clone(),
            },
            _ => RunOutcome::failed(FailureKind::MissingOutput(job.output_path.clone()), stderr),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Metadata;

    fn reporter() -> (Arc<TaskRegistry>, ProgressReporter) {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.create("render", "Rendering", Metadata::new());
        (Arc::clone(&registry), ProgressReporter::new(registry, id))
    }

    fn sh(task_id: TaskId, script: &str, output: &std::path::Path) -> Job {
        Job::new(
            task_id,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            output,
        )
        .unwrap()
    }

    #[test]
    fn test_error_text_prefers_stderr_for_exit() {
        let outcome = RunOutcome::failed(FailureKind::Exit(Some(1)), "Invalid data found\n");
        assert_eq!(outcome.error_text().unwrap(), "Invalid data found");

        let outcome = RunOutcome::failed(FailureKind::Exit(Some(3)), "  ");
        assert_eq!(outcome.error_text().unwrap(), "process exited with code 3");
    }

    #[test]
    fn test_error_text_keeps_description_last() {
        let outcome = RunOutcome::failed(FailureKind::TimedOut(Duration::from_secs(5)), "frame=10");
        assert_eq!(
            outcome.error_text().unwrap(),
            "frame=10\nprocess timed out after 5s"
        );

        let ok = RunOutcome::Succeeded {
            output_path: "/tmp/a".into(),
        };
        assert!(ok.error_text().is_none());
    }

    #[test]
    fn test_timeout_policy_from_config() {
        let config = QueueConfig::default();
        let runner = LocalProcessRunner::new(&config);
        assert_eq!(runner.timeout(), TimeoutPolicy::hard_secs(300));
        assert_eq!(TimeoutPolicy::from(None), TimeoutPolicy::None);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_failed_outcome() {
        let (_registry, reporter) = reporter();
        let job = Job::new(
            reporter.task_id(),
            vec!["/nonexistent/mediaforge-test-binary".to_string()],
            "/tmp/never.mp4",
        )
        .unwrap();

        let outcome = LocalProcessRunner::default()
            .run(&job, &reporter, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: FailureKind::Spawn(_),
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_requires_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("out.txt");
        let (registry, reporter) = reporter();

        let job = sh(reporter.task_id(), &format!("echo done > '{}'", output.display()), &output);
        let outcome = LocalProcessRunner::default()
            .run(&job, &reporter, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RunOutcome::Succeeded { output_path: output });

        let task = registry.get(reporter.task_id()).unwrap();
        assert_eq!(task.progress, 50);
        assert_eq!(task.message, "Processing...");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("missing.mp4");
        let (_registry, reporter) = reporter();

        let job = sh(reporter.task_id(), "echo banner >&2", &output);
        let outcome = LocalProcessRunner::default()
            .run(&job, &reporter, &CancellationToken::new())
            .await;

        let error = outcome.error_text().unwrap();
        assert!(error.starts_with("banner"));
        assert!(error.ends_with(&format!("expected output not found: {}", output.display())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let (_registry, reporter) = reporter();

        let config = QueueConfig {
            stderr_max_lines: 3,
            ..QueueConfig::default()
        };
        let job = sh(
            reporter.task_id(),
            "for i in 1 2 3 4 5 6; do echo line$i >&2; done; exit 2",
            &output,
        );
        let outcome = LocalProcessRunner::new(&config)
            .run(&job, &reporter, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            RunOutcome::failed(FailureKind::Exit(Some(2)), "line4\nline5\nline6")
        );
    }

    #[test]
    fn test_tail_decodes_lossily_and_skips_blank_lines() {
        let mut tail = StderrTail::new(2);
        tail.push(b"Input #0 from caf\xe9.mp4");
        tail.push(b"");
        tail.push(b"frame=1  ");
        assert_eq!(tail.joined(), "Input #0 from caf\u{FFFD}.mp4\nframe=1");

        tail.push(b"frame=2");
        assert_eq!(tail.joined(), "frame=1\nframe=2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_stderr_does_not_break_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let (_registry, reporter) = reporter();

        let script = format!(
            "printf 'Input #0 from caf\\351.mp4\\n' >&2; sleep 0.3; \
             i=0; while [ $i -lt 2000 ]; do echo \"frame $i\" >&2; i=$((i+1)); done; \
             echo ok > '{}'",
            output.display()
        );
        let job = sh(reporter.task_id(), &script, &output);
        let outcome = LocalProcessRunner::default()
            .run(&job, &reporter, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RunOutcome::Succeeded { output_path: output });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_carriage_returns_split_progress_lines() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let (_registry, reporter) = reporter();

        let job = sh(
            reporter.task_id(),
            "printf 'frame=1\\rframe=2\\rframe=3\\r\\nConversion failed!\\n' >&2; exit 1",
            &output,
        );
        let outcome = LocalProcessRunner::default()
            .run(&job, &reporter, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            RunOutcome::failed(
                FailureKind::Exit(Some(1)),
                "frame=1\nframe=2\nframe=3\nConversion failed!"
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let (_registry, reporter) = reporter();

        let job = sh(reporter.task_id(), "exec sleep 30", &output);
        let runner = LocalProcessRunner::default()
            .with_timeout(TimeoutPolicy::Hard(Duration::from_millis(200)));

        let started = std::time::Instant::now();
        let outcome = runner.run(&job, &reporter, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: FailureKind::TimedOut(_),
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let (_registry, reporter) = reporter();

        let job = sh(reporter.task_id(), "exec sleep 30", &output);
        let runner = LocalProcessRunner::default().with_grace(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = runner.run(&job, &reporter, &cancel).await;
        assert_eq!(
            outcome.error_text().unwrap(),
            "process cancelled: worker pool shut down"
        );
    }
}
