//! Storage module for persisting crawl data
//!
//! This module handles the two storage collaborators of the scheduler:
//! - Batch upsert of scraped records
//! - Snapshot and restore of scheduler state for resumption
//!
//! Deduplication is the scheduler's job; the stores only have to accept
//! repeated writes of the same record.

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{PersistenceGateway, StateStore, StorageError, StorageResult};

use serde::{Deserialize, Serialize};

/// One scraped item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier of the item within its target
    pub id: String,

    /// The item as returned by the remote
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
