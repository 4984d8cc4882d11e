//! SQLite connection pool with read/write separation for one backend.
//!
//! - Writes are serialized through the pool's write mutex, on a fresh
//!   connection, and re-run on contention by the store's [`RetryPolicy`].
//! - Reads open fresh connections without serialization (WAL concurrent reads).
//!
//! Connections are NOT pooled (opened fresh each time) so that a blocking
//! producer streaming rows never holds a connection another call needs.

use crate::core::db;
use crate::core::error::{FederationError, Result};
use crate::core::retry::{Retried, RetryPolicy};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub struct SqlitePool {
    db_path: PathBuf,
    busy_timeout: Duration,
    retry: RetryPolicy,
    write_lock: Mutex<()>,
}

impl SqlitePool {
    pub fn new(db_path: &Path, busy_timeout: Duration, retry: RetryPolicy) -> Self {
        SqlitePool {
            db_path: db_path.to_path_buf(),
            busy_timeout,
            retry,
            write_lock: Mutex::new(()),
        }
    }

    /// Execute a closure with a write connection, retrying on busy/locked.
    /// The closure may run several times, so it must be `FnMut`.
    pub fn with_write<F, R>(&self, action: &str, mut f: F) -> Result<Retried<R>>
    where
        F: FnMut(&mut Connection) -> Result<R>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| FederationError::Config("Pool write lock poisoned".to_string()))?;
        self.retry.write_with_retry(action, || {
            let mut conn = db::connect(&self.db_path, self.busy_timeout)?;
            f(&mut conn)
        })
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = db::connect(&self.db_path, self.busy_timeout)?;
        f(&conn)
    }
}
