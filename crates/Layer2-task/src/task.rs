//! Task definition and types

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Caller-supplied context attached at creation; never interpreted here
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The externally observable record of one long-running operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Short category tag ("split", "transcription", ...)
    #[serde(rename = "type")]
    pub task_type: String,

    /// Fixed at creation
    pub description: String,

    /// Current human-readable status text
    pub message: String,

    pub status: TaskStatus,

    /// Always within 0..=100
    pub progress: u8,

    pub metadata: Metadata,

    /// Present only once the task completed
    pub result: Option<TaskOutput>,

    /// Present only once the task failed
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    pub fn new(task_type: impl Into<String>, description: impl Into<String>, metadata: Metadata) -> Self {
        let description = description.into();
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            message: description.clone(),
            description,
            status: TaskStatus::Pending,
            progress: 0,
            metadata,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Known result shapes, one per kind of operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    /// A single rendered artifact (transcode, trim, speed, volume, overlay...)
    Render { output_path: PathBuf },

    /// Several artifacts cut from one source
    Split { outputs: Vec<PathBuf> },

    /// Subtitle file produced by a transcription backend
    Transcription {
        subtitle_path: PathBuf,
        duration_secs: f64,
    },

    /// Audio classification and the file's new location
    Classification {
        category: String,
        output_path: PathBuf,
    },

    /// Scene detection summary and the generated timeline
    RoughCut { scenes: usize, timeline_path: PathBuf },
}

impl TaskOutput {
    pub fn render(output_path: impl Into<PathBuf>) -> Self {
        Self::Render {
            output_path: output_path.into(),
        }
    }

    /// Primary artifact, when the shape has exactly one
    pub fn primary_path(&self) -> Option<&PathBuf> {
        match self {
            TaskOutput::Render { output_path } => Some(output_path),
            TaskOutput::Split { outputs } => outputs.first(),
            TaskOutput::Transcription { subtitle_path, .. } => Some(subtitle_path),
            TaskOutput::Classification { output_path, .. } => Some(output_path),
            TaskOutput::RoughCut { timeline_path, .. } => Some(timeline_path),
        }
    }
}
