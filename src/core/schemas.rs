//! Database schema of the primary SQLite backend.
//!
//! Stream membership lives in the FTS5 table `events_fts`, keyed by the
//! `events` rowid. Its `stream_ids` text is the all-rows token followed by one
//! hex-encoded token per stream id (see `SqlDialect::token`), so matching
//! never depends on how the tokenizer splits or folds the raw ids.

pub const EVENTS_DB_NAME: &str = "events.db";

pub const EVENTS_DB_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        rowid INTEGER PRIMARY KEY,
        user_id TEXT NOT NULL,
        id TEXT NOT NULL,
        stream_ids TEXT NOT NULL,
        time REAL,
        deleted REAL,
        event_type TEXT,
        body TEXT NOT NULL,
        UNIQUE(user_id, id)
    );
    CREATE INDEX IF NOT EXISTS idx_events_user_time ON events(user_id, time);
    CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
        stream_ids,
        tokenize = "unicode61 remove_diacritics 0"
    );
    CREATE TABLE IF NOT EXISTS streams (
        user_id TEXT NOT NULL,
        id TEXT NOT NULL,
        parent_id TEXT,
        position INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY(user_id, id)
    );
"#;
