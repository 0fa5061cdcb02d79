//! Queue Config - concurrency, timeouts and retention
//!
//! Resolution order (later wins, field by field):
//! 1. built-in defaults
//! 2. global `<config_dir>/mediaforge/queue.json`
//! 3. project `./.mediaforge/queue.json`
//! 4. `MEDIAFORGE_MAX_CONCURRENT`

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Config file name
pub const QUEUE_CONFIG_FILE: &str = "queue.json";

/// Environment override for the concurrency ceiling
pub const ENV_MAX_CONCURRENT: &str = "MEDIAFORGE_MAX_CONCURRENT";

/// Job core settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Worker slots; also the ceiling on concurrently running processes
    pub max_concurrent: usize,

    /// Per-process timeout in seconds (0 = no timeout)
    pub process_timeout_secs: u64,

    /// How long in-flight processes may keep running after shutdown
    pub shutdown_grace_secs: u64,

    /// Maximum characters stored in a task's `error`
    pub error_max_len: usize,

    /// Maximum characters of stderr echoed into the failure message
    pub message_max_len: usize,

    /// Stderr lines retained while a process runs
    pub stderr_max_lines: usize,

    /// Tasks older than this are pruned
    pub task_retention_hours: u64,

    /// Period of the background prune loop (0 = disabled)
    pub prune_interval_secs: u64,

    /// Entries kept by the activity log
    pub activity_log_capacity: usize,

    /// Explicit encoder binary; discovered when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            process_timeout_secs: 300,
            shutdown_grace_secs: 5,
            error_max_len: 200,
            message_max_len: 100,
            stderr_max_lines: 200,
            task_retention_hours: 7 * 24,
            prune_interval_secs: 3600,
            activity_log_capacity: 100,
            ffmpeg_path: None,
        }
    }
}

impl QueueConfig {
    /// Load global + project files and apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(global) = JsonStore::global() {
            if let Some(layer) = global.load_optional::<QueueConfigLayer>(QUEUE_CONFIG_FILE)? {
                debug!("Applying global queue config from {}", global.base_dir().display());
                config.merge(layer);
            }
        }

        let project = JsonStore::current_project()?;
        if let Some(layer) = project.load_optional::<QueueConfigLayer>(QUEUE_CONFIG_FILE)? {
            debug!("Applying project queue config from {}", project.base_dir().display());
            config.merge(layer);
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a single store, without environment overrides
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        let mut config = Self::default();
        if let Some(layer) = store.load_optional::<QueueConfigLayer>(QUEUE_CONFIG_FILE)? {
            config.merge(layer);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay the fields present in `layer`
    pub fn merge(&mut self, layer: QueueConfigLayer) {
        if let Some(v) = layer.max_concurrent {
            self.max_concurrent = v;
        }
        if let Some(v) = layer.process_timeout_secs {
            self.process_timeout_secs = v;
        }
        if let Some(v) = layer.shutdown_grace_secs {
            self.shutdown_grace_secs = v;
        }
        if let Some(v) = layer.error_max_len {
            self.error_max_len = v;
        }
        if let Some(v) = layer.message_max_len {
            self.message_max_len = v;
        }
        if let Some(v) = layer.stderr_max_lines {
            self.stderr_max_lines = v;
        }
        if let Some(v) = layer.task_retention_hours {
            self.task_retention_hours = v;
        }
        if let Some(v) = layer.prune_interval_secs {
            self.prune_interval_secs = v;
        }
        if let Some(v) = layer.activity_log_capacity {
            self.activity_log_capacity = v;
        }
        if layer.ffmpeg_path.is_some() {
            self.ffmpeg_path = layer.ffmpeg_path;
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(ENV_MAX_CONCURRENT) {
            self.max_concurrent = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a positive integer, got '{}'", ENV_MAX_CONCURRENT, raw))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("maxConcurrent must be at least 1".to_string()));
        }
        if self.error_max_len == 0 {
            return Err(Error::Config("errorMaxLen must be at least 1".to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Duration accessors
    // ========================================================================

    pub fn process_timeout(&self) -> Option<Duration> {
        (self.process_timeout_secs > 0).then(|| Duration::from_secs(self.process_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_hours.saturating_mul(60 * 60))
    }

    pub fn prune_interval(&self) -> Option<Duration> {
        (self.prune_interval_secs > 0).then(|| Duration::from_secs(self.prune_interval_secs))
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs();
        self
    }
}

/// One config file; absent fields leave the lower layer untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfigLayer {
    pub max_concurrent: Option<usize>,
    pub process_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub error_max_len: Option<usize>,
    pub message_max_len: Option<usize>,
    pub stderr_max_lines: Option<usize>,
    pub task_retention_hours: Option<u64>,
    pub prune_interval_secs: Option<u64>,
    pub activity_log_capacity: Option<usize>,
    pub ffmpeg_path: Option<PathBuf>,
}
