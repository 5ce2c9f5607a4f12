//! Storage traits and error types
//!
//! The scheduler depends on two collaborators: a gateway that upserts scraped
//! records, and a store that snapshots and restores scheduler state. Both
//! must accept concurrent callers.

use crate::state::ScheduleState;
use crate::storage::Record;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Batch upsert of scraped records
///
/// Implementations must be idempotent: saving a record that is already
/// stored updates it in place, keyed by target and item id.
pub trait PersistenceGateway: Send + Sync {
    fn save_batch(&self, target_key: &str, records: &[Record]) -> StorageResult<()>;
}

/// Durable snapshot and restore of scheduler state
pub trait StateStore: Send + Sync {
    /// Loads the last snapshot for a target, if any
    fn load(&self, target_key: &str) -> StorageResult<Option<ScheduleState>>;

    /// Replaces the snapshot for a target
    fn save(&self, target_key: &str, state: &ScheduleState) -> StorageResult<()>;
}
