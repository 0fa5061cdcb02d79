//! # mediaforge-task
//!
//! Background job core for MediaForge.
//! Tracks long-running media operations as tasks and runs their external
//! encoder processes under a fixed concurrency ceiling.
//!
//! ## Features
//!
//! - Task registry with atomic updates and immutable terminal states
//! - FIFO job queue gated by a counting semaphore
//! - Worker pool with per-job panic isolation and graceful shutdown
//! - Child-process runner with timeout and bounded stderr capture
//! - Encoder capability probe (hardware acceleration detection)
//! - Change broadcast, activity log and periodic pruning

pub mod job;
pub mod log;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod state;
pub mod task;

// Task model
pub use state::TaskStatus;
pub use task::{Metadata, Task, TaskId, TaskOutput};

// Registry
pub use registry::{TaskCounts, TaskEvent, TaskRegistry, TaskUpdate, UpdateOutcome};

// Dispatch
pub use job::Job;
pub use pool::{WorkerPool, DROPPED_ERROR};
pub use queue::{Dispatch, JobQueue};
pub use runner::{
    FailureKind, LocalProcessRunner, ProcessRunner, ProgressReporter, RunOutcome, TimeoutPolicy,
};

// Facade
pub use manager::{JobManager, QueueStats};

// Activity log
pub use log::{ActivityEntry, ActivityKind, ActivityLog};

// Capability probe
pub use probe::{Capabilities, HwAccel};
