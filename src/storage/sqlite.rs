//! SQLite storage implementation
//!
//! This module provides a SQLite-backed implementation of both storage
//! collaborators. The connection sits behind a mutex so that concurrent
//! workers serialize their writes.

use crate::state::ScheduleState;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{PersistenceGateway, StateStore, StorageResult};
use crate::storage::Record;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the records stored for a target
    pub fn count_records(&self, target_key: &str) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM records WHERE target_key = ?1",
            params![target_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Loads one stored record by id
    pub fn get_record(&self, target_key: &str, item_id: &str) -> StorageResult<Option<Record>> {
        let payload: Option<String> = self
            .conn()
            .query_row(
                "SELECT payload FROM records WHERE target_key = ?1 AND item_id = ?2",
                params![target_key, item_id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|payload| {
                Ok(Record {
                    id: item_id.to_string(),
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .transpose()
    }

    /// Lists every target that has a snapshot, with its status and unique count
    pub fn list_targets(&self) -> StorageResult<Vec<(String, String, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target_key, status, total_unique FROM schedule_states ORDER BY target_key",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

impl PersistenceGateway for SqliteStorage {
    fn save_batch(&self, target_key: &str, records: &[Record]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO records (target_key, item_id, payload, first_seen_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(target_key, item_id)
                 DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            )?;

            for record in records {
                let payload = serde_json::to_string(&record.payload)?;
                stmt.execute(params![target_key, record.id, payload, now])?;
            }
        }
        tx.commit()?;

        Ok(())
    }
}

impl StateStore for SqliteStorage {
    fn load(&self, target_key: &str) -> StorageResult<Option<ScheduleState>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT state_json FROM schedule_states WHERE target_key = ?1",
                params![target_key],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save(&self, target_key: &str, state: &ScheduleState) -> StorageResult<()> {
        let json = serde_json::to_string(state)?;
        let reason = state.reason.map(|r| r.as_str());

        self.conn().execute(
            "INSERT OR REPLACE INTO schedule_states
             (target_key, status, reason, total_unique, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target_key,
                state.status.to_db_string(),
                reason,
                state.total_unique as i64,
                json,
                state.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }
}
