//! Job - one queued unit of execution bound to a task

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use mediaforge_foundation::{Error, Result};
use std::path::PathBuf;

/// A fully built command plus the artifact it is expected to produce
#[derive(Debug, Clone)]
pub struct Job {
    /// Owning task
    pub task_id: TaskId,

    /// Argument vector; `command[0]` is the program
    pub command: Vec<String>,

    /// Must exist after a zero exit for the job to count as a success
    pub output_path: PathBuf,

    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Build a job, rejecting malformed submissions
    pub fn new(task_id: TaskId, command: Vec<String>, output_path: impl Into<PathBuf>) -> Result<Self> {
        let output_path = output_path.into();

        match command.first() {
            None => return Err(Error::validation("command must not be empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(Error::validation("command program must not be blank"))
            }
            Some(_) => {}
        }

        if output_path.as_os_str().is_empty() {
            return Err(Error::validation("output path must not be empty"));
        }

        Ok(Self {
            task_id,
            command,
            output_path,
            submitted_at: Utc::now(),
        })
    }

    pub fn program(&self) -> &str {
        &self.command[0]
    }

    pub fn args(&self) -> &[String] {
        &self.command[1..]
    }

    /// Shell-like rendering for log lines
    pub fn display_command(&self) -> String {
        self.command
            .iter()
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("'{}'", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
