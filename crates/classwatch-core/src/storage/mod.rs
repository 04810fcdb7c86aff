//! Storage Module
//!
//! SQLite-backed persistence for:
//! - Session records with lifecycle timestamps and running counters
//! - The append-only detection event log
//! - Last live snapshot and final report per session

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{Result, Storage, StorageError, StorageStats};
