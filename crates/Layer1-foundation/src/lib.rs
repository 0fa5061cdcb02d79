//! # mediaforge-foundation
//!
//! Foundation layer for MediaForge:
//! - Error: shared error taxonomy used by every layer
//! - Config: queue and worker settings (`QueueConfig`)
//! - Storage: JSON file store backing the config files
//!
//! Nothing in this crate spawns processes or touches the runtime; the job
//! core lives in `mediaforge-task`.

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{QueueConfig, ENV_MAX_CONCURRENT, QUEUE_CONFIG_FILE};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
