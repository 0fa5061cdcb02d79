//! Config - queue and worker settings
//!
//! - `queue.rs` - `QueueConfig`, layered global + project + environment

mod queue;

pub use queue::{QueueConfig, QueueConfigLayer, ENV_MAX_CONCURRENT, QUEUE_CONFIG_FILE};
