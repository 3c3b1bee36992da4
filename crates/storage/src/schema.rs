use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS comment_resolutions (
    row_id BLOB PRIMARY KEY CHECK (length(row_id) = 16),
    ballot_id BLOB NOT NULL CHECK (length(ballot_id) = 16),
    comment_id BLOB NOT NULL CHECK (length(comment_id) = 16),
    comment_seq INTEGER NOT NULL,
    resolution_id INTEGER CHECK (resolution_id IS NULL OR resolution_id >= 0),
    last_modified INTEGER,
    fields BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cr_comment ON comment_resolutions (comment_id, resolution_id);
CREATE INDEX IF NOT EXISTS idx_cr_ballot ON comment_resolutions (ballot_id, comment_seq, resolution_id);
";
