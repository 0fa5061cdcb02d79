//! Subcommand handlers

use anyhow::Context;
use mediaforge_foundation::{Error, JsonStore, QueueConfig, QUEUE_CONFIG_FILE};
use mediaforge_task::{Capabilities, JobManager, Metadata, Task, TaskOutput, TaskStatus};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Slack added on top of the process timeout when waiting for a task
const WAIT_MARGIN: Duration = Duration::from_secs(30);

/// Wait bound when the process timeout is disabled
const UNBOUNDED_WAIT: Duration = Duration::from_secs(24 * 3600);

pub struct RunRequest {
    pub output: PathBuf,
    pub task_type: String,
    pub description: Option<String>,
    pub hwaccel: bool,
    pub command: Vec<String>,
}

pub async fn probe(config: &QueueConfig) -> anyhow::Result<()> {
    let caps = Capabilities::detect(config).await;
    println!("{}", serde_json::to_string_pretty(&caps)?);
    Ok(())
}

pub fn show_config(config: &QueueConfig, save: bool) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if save {
        let store = JsonStore::current_project()?;
        store.save(QUEUE_CONFIG_FILE, config)?;
        info!(path = %store.file_path(QUEUE_CONFIG_FILE).display(), "Configuration saved");
    }
    Ok(())
}

pub async fn run(config: QueueConfig, request: RunRequest) -> anyhow::Result<()> {
    let command = if request.hwaccel {
        let caps = Capabilities::detect(&config).await;
        if !caps.gpu_enabled() {
            warn!("No hardware acceleration available, running unchanged");
        }
        caps.apply(request.command)
    } else {
        request.command
    };

    let wait_for = wait_bound(&config);

    let manager = JobManager::with_local_runner(config);

    let description = request
        .description
        .unwrap_or_else(|| format!("{} {}", request.task_type, request.output.display()));
    let mut metadata = Metadata::new();
    metadata.insert("output".into(), json!(request.output));

    let task_id = manager.create_task(request.task_type, description, metadata);
    manager
        .submit(task_id, command, request.output)
        .context("job rejected")?;
    info!(task_id = %task_id.short(), "Job submitted");

    let task = tokio::select! {
        result = manager.wait(task_id, wait_for) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            manager.shutdown().await;
            manager.get_task(task_id)
        }
    };
    manager.shutdown().await;
    let task = task?;

    println!("{}", serde_json::to_string_pretty(&task)?);

    if task.status == TaskStatus::Failed {
        return Err(task_failure(&task).into());
    }
    if let Some(path) = task.result.as_ref().and_then(TaskOutput::primary_path) {
        info!(task_id = %task_id.short(), output = %path.display(), "Job completed");
    }
    Ok(())
}

/// How long `run` waits for its task before giving up
fn wait_bound(config: &QueueConfig) -> Duration {
    config
        .process_timeout()
        .map(|timeout| {
            timeout
                .saturating_add(config.shutdown_grace())
                .saturating_add(WAIT_MARGIN)
        })
        .unwrap_or(UNBOUNDED_WAIT)
}

fn task_failure(task: &Task) -> Error {
    Error::Execution(format!(
        "task {} failed: {}",
        task.id.short(),
        task.error.as_deref().unwrap_or("unknown error")
    ))
}

/// Process exit code for an error returned by a subcommand
///
/// 1 for a job that ran and failed, 2 for a bad request, 3 for anything else.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_execution_failure() => 1,
        Some(e) if e.is_user_facing() => 2,
        _ => 3,
    }
}
