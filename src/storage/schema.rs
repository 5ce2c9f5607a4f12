//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Fleet-Crawl database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Scraped items, one row per target and item id
CREATE TABLE IF NOT EXISTS records (
    target_key TEXT NOT NULL,
    item_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (target_key, item_id)
);

CREATE INDEX IF NOT EXISTS idx_records_target ON records(target_key);

-- Latest scheduler snapshot per target
CREATE TABLE IF NOT EXISTS schedule_states (
    target_key TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    reason TEXT,
    total_unique INTEGER NOT NULL DEFAULT 0,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
