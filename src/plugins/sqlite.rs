//! Primary structured store on SQLite.
//!
//! Events are stored as JSON bodies with indexed columns for the filters;
//! stream membership is matched through the FTS5 table `events_fts` using the
//! compiled [`SqlDialect`] expression. Reads stream from a blocking producer
//! through a bounded channel; writes go through the pool's retry harness.

use crate::core::compile::{ALL_ROWS_TOKEN, Compiled, SqlDialect, compile};
use crate::core::config::Config;
use crate::core::db;
use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use crate::core::pool::SqlitePool;
use crate::core::store::{
    EventStore, EventStream, channel_stream, select_streams, stamp_new_event, tombstone,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    dialect: SqlDialect,
    channel_capacity: usize,
}

/// A compiled `SELECT body ...` statement and its parameters.
struct Select {
    sql: String,
    params: Vec<SqlValue>,
}

impl SqliteStore {
    pub fn open(db_path: &Path, config: &Config) -> Result<Self> {
        db::initialize(db_path, config.sqlite.busy_timeout())?;
        Ok(SqliteStore {
            pool: Arc::new(SqlitePool::new(
                db_path,
                config.sqlite.busy_timeout(),
                config.retry,
            )),
            dialect: SqlDialect::default(),
            channel_capacity: config.streaming.channel_capacity,
        })
    }

    /// Use another SQL dialect, e.g. [`SqlDialect::legacy`] for stored query
    /// strings written by older deployments.
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Build the event selection; `None` when the stream query matches nothing.
    fn select(&self, user_id: &str, query: &EventsQuery) -> Option<Select> {
        let compiled = compile(&query.streams, &self.dialect)?;
        let mut sql = String::from("SELECT body FROM events WHERE user_id = ?");
        let mut params = vec![SqlValue::Text(user_id.to_string())];

        if let Compiled::Predicate(expr) = compiled {
            let membership = "rowid IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?)";
            // Tombstones are no longer indexed; they match any stream query.
            if query.include_deletions {
                sql.push_str(&format!(" AND (deleted IS NOT NULL OR {membership})"));
            } else {
                sql.push_str(&format!(" AND {membership}"));
            }
            params.push(SqlValue::Text(expr));
        }
        if !query.include_deletions {
            sql.push_str(" AND deleted IS NULL");
        }
        if let Some(from) = query.from_time {
            sql.push_str(" AND (time IS NULL OR time >= ?)");
            params.push(SqlValue::Real(from));
        }
        if let Some(to) = query.to_time {
            sql.push_str(" AND (time IS NULL OR time <= ?)");
            params.push(SqlValue::Real(to));
        }
        if !query.types.is_empty() {
            let marks = vec!["?"; query.types.len()].join(", ");
            sql.push_str(&format!(" AND event_type IN ({marks})"));
            params.extend(query.types.iter().cloned().map(SqlValue::Text));
        }
        sql.push_str(if query.sort_ascending {
            " ORDER BY time ASC, rowid ASC"
        } else {
            " ORDER BY time DESC, rowid DESC"
        });
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
        Some(Select { sql, params })
    }

    /// Run a query to completion on the calling thread.
    pub fn events_blocking(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        let Some(select) = self.select(user_id, query) else {
            return Ok(Vec::new());
        };
        self.pool
            .with_read(|conn| {
                let mut stmt = conn.prepare(&select.sql)?;
                let mut rows = stmt.query(params_from_iter(select.params.iter()))?;
                let mut events = Vec::new();
                while let Some(row) = rows.next()? {
                    let body: String = row.get(0)?;
                    events.push(serde_json::from_str(&body)?);
                }
                Ok(events)
            })
            .map_err(classify_match_error)
    }

    /// Write `f` with retries on a blocking thread.
    async fn write<F, R>(&self, action: &'static str, mut f: F) -> Result<R>
    where
        F: FnMut(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let retried = tokio::task::spawn_blocking(move || pool.with_write(action, &mut f))
            .await
            .map_err(|e| FederationError::Io(std::io::Error::other(e)))??;
        debug!(action, attempts = retried.attempts, "sqlite write");
        Ok(retried.value)
    }

    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || pool.with_read(f))
            .await
            .map_err(|e| FederationError::Io(std::io::Error::other(e)))?
    }
}

/// FTS5 rejects malformed match expressions at execution time; those are
/// query errors, not storage failures.
fn classify_match_error(err: FederationError) -> FederationError {
    match &err {
        FederationError::Sqlite(rusqlite::Error::SqliteFailure(_, Some(msg)))
            if msg.contains("fts5") =>
        {
            FederationError::QueryMalformed(msg.clone())
        }
        _ => err,
    }
}

/// Text indexed for an event: the all-rows token, then one token per stream id.
fn fts_text(stream_ids: &[String]) -> String {
    std::iter::once(ALL_ROWS_TOKEN.to_string())
        .chain(stream_ids.iter().map(|id| SqlDialect::token(id)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn insert_event(conn: &mut Connection, user_id: &str, event: &Event) -> Result<()> {
    let tx = conn.transaction()?;
    let exists: Option<i64> = tx
        .query_row(
            "SELECT rowid FROM events WHERE user_id = ?1 AND id = ?2",
            params![user_id, event.id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(FederationError::Conflict(format!("event '{}'", event.id)));
    }
    tx.execute(
        "INSERT INTO events(user_id, id, stream_ids, time, deleted, event_type, body)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            event.id,
            serde_json::to_string(&event.stream_ids)?,
            event.time,
            event.deleted,
            event.event_type,
            serde_json::to_string(event)?
        ],
    )?;
    let rowid = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO events_fts(rowid, stream_ids) VALUES(?1, ?2)",
        params![rowid, fts_text(&event.stream_ids)],
    )?;
    tx.commit()?;
    Ok(())
}

fn mark_deleted(conn: &mut Connection, user_id: &str, event_id: &str) -> Result<Event> {
    let tx = conn.transaction()?;
    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, body FROM events WHERE user_id = ?1 AND id = ?2",
            params![user_id, event_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (rowid, body) =
        row.ok_or_else(|| FederationError::NotFound(format!("event '{event_id}'")))?;
    let current: Event = serde_json::from_str(&body)?;
    if current.deleted.is_some() {
        return Ok(current);
    }
    let gone = tombstone(&current);
    tx.execute(
        "UPDATE events SET stream_ids = '[]', time = NULL, event_type = NULL,
         deleted = ?1, body = ?2
         WHERE rowid = ?3",
        params![gone.deleted, serde_json::to_string(&gone)?, rowid],
    )?;
    tx.execute("DELETE FROM events_fts WHERE rowid = ?1", params![rowid])?;
    tx.commit()?;
    Ok(gone)
}

#[async_trait]
impl EventStore for SqliteStore {
    fn kind(&self) -> &str {
        "sqlite"
    }

    async fn get_streams(&self, user_id: &str, query: &StreamsQuery) -> Result<Vec<Stream>> {
        let user = user_id.to_string();
        let flat = self
            .read(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT body FROM streams WHERE user_id = ?1 ORDER BY position")?;
                let rows = stmt.query_map(params![user], |row| row.get::<_, String>(0))?;
                let mut streams = Vec::new();
                for body in rows {
                    streams.push(serde_json::from_str::<Stream>(&body?)?);
                }
                Ok(streams)
            })
            .await?;
        select_streams(flat, query)
    }

    async fn create_stream(&self, user_id: &str, mut stream: Stream) -> Result<Stream> {
        if stream.id.is_empty() {
            stream.id = crate::core::time::new_event_id();
        }
        stream.children.clear();
        let user = user_id.to_string();
        let record = stream.clone();
        self.write("streams.create", move |conn| {
            let tx = conn.transaction()?;
            let position: i64 = tx.query_row(
                "SELECT COUNT(*) FROM streams WHERE user_id = ?1",
                params![user],
                |row| row.get(0),
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO streams(user_id, id, parent_id, position, body)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    user,
                    record.id,
                    record.parent_id,
                    position,
                    serde_json::to_string(&record)?
                ],
            )?;
            if inserted == 0 {
                return Err(FederationError::Conflict(format!("stream '{}'", record.id)));
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(stream)
    }

    async fn get_events_streamed(&self, user_id: &str, query: &EventsQuery) -> Result<EventStream> {
        let Some(select) = self.select(user_id, query) else {
            return Ok(stream::empty().boxed());
        };
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let pool = Arc::clone(&self.pool);

        tokio::task::spawn_blocking(move || {
            let mut ready = Some(ready_tx);
            let outcome = pool.with_read(|conn| {
                let mut stmt = conn.prepare(&select.sql)?;
                let mut rows = stmt.query(params_from_iter(select.params.iter()))?;
                loop {
                    // The first step surfaces match-syntax errors; report them
                    // as an open failure rather than a stream item.
                    let row = rows.next()?;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    let Some(row) = row else { break };
                    let body: String = row.get(0)?;
                    let event = serde_json::from_str::<Event>(&body).map_err(FederationError::from);
                    if tx.blocking_send(event).is_err() {
                        debug!("sqlite event stream dropped by consumer");
                        break;
                    }
                }
                Ok(())
            });
            if let Err(e) = outcome {
                let e = classify_match_error(e);
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(e));
                    }
                    None => {
                        let _ = tx.blocking_send(Err(e));
                    }
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| FederationError::Io(std::io::Error::other("sqlite producer stopped")))??;
        Ok(channel_stream(rx))
    }

    async fn get_events(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        let Some(select) = self.select(user_id, query) else {
            return Ok(Vec::new());
        };
        self.read(move |conn| {
            let mut stmt = conn.prepare(&select.sql)?;
            let mut rows = stmt.query(params_from_iter(select.params.iter()))?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                let body: String = row.get(0)?;
                events.push(serde_json::from_str(&body)?);
            }
            Ok(events)
        })
        .await
        .map_err(classify_match_error)
    }

    async fn create_event(&self, user_id: &str, event: Event) -> Result<Event> {
        let event = stamp_new_event(event, user_id);
        let user = user_id.to_string();
        let record = event.clone();
        self.write(
            "events.create",
            move |conn| insert_event(conn, &user, &record),
        )
        .await?;
        Ok(event)
    }

    async fn delete_event(&self, user_id: &str, event_id: &str) -> Result<Event> {
        let user = user_id.to_string();
        let id = event_id.to_string();
        self.write("events.delete", move |conn| mark_deleted(conn, &user, &id))
            .await
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let user = user_id.to_string();
        self.write("deleteUser", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM events_fts
                 WHERE rowid IN (SELECT rowid FROM events WHERE user_id = ?1)",
                params![user],
            )?;
            tx.execute("DELETE FROM events WHERE user_id = ?1", params![user])?;
            tx.execute("DELETE FROM streams WHERE user_id = ?1", params![user])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_storage_infos(&self, user_id: &str) -> Result<StorageInfos> {
        let user = user_id.to_string();
        self.read(move |conn| {
            let (event_count, event_bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM events WHERE user_id = ?1",
                params![user],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (stream_count, stream_bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM streams WHERE user_id = ?1",
                params![user],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(StorageInfos {
                size_bytes: u64::try_from(event_bytes + stream_bytes).unwrap_or(0),
                event_count: u64::try_from(event_count).unwrap_or(0),
                stream_count: u64::try_from(stream_count).unwrap_or(0),
            })
        })
        .await
    }
}
