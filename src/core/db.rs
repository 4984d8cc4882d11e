use crate::core::error::Result;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub fn connect(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    Ok(conn)
}

/// Create the database file and its tables if missing.
pub fn initialize(db_path: &Path, busy_timeout: Duration) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = connect(db_path, busy_timeout)?;
    conn.execute_batch(schemas::EVENTS_DB_SCHEMA)?;
    Ok(())
}
