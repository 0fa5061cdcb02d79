//! Storage module for MediaForge
//!
//! - `json`: JSON file store for settings (global + per-project)

mod json;

pub use json::JsonStore;
