//! Append-only audit log, one JSON-lines file per user.
//!
//! Records are never rewritten: deletion is not supported and streams are
//! derived from the stream ids seen in the log. Queries read the file line by
//! line and evaluate the in-memory dialect on each record, yielding matches
//! in append order.

use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use crate::core::store::{EventStore, EventStream, select_streams, stamp_new_event};
use crate::plugins::memory::Matcher;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::debug;

pub const AUDIT_FILE_NAME: &str = "audit.jsonl";

pub struct AuditStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditStore {
    pub fn new(root: &Path) -> Self {
        AuditStore {
            root: root.to_path_buf(),
            append_lock: Mutex::new(()),
        }
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        if user_id.is_empty() {
            return Err(FederationError::QueryMalformed("empty user id".to_string()));
        }
        Ok(self.root.join(dir_name(user_id)))
    }

    fn log_path(&self, user_id: &str) -> Result<PathBuf> {
        Ok(self.user_dir(user_id)?.join(AUDIT_FILE_NAME))
    }

    /// Line reader over the user's log; `None` when nothing was logged yet.
    async fn open_lines(&self, user_id: &str) -> Result<Option<Lines<BufReader<fs::File>>>> {
        match fs::File::open(self.log_path(user_id)?).await {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all(&self, user_id: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        if let Some(mut lines) = self.open_lines(user_id).await? {
            while let Some(line) = lines.next_line().await? {
                if !line.trim().is_empty() {
                    events.push(serde_json::from_str(&line)?);
                }
            }
        }
        Ok(events)
    }
}

/// Directory name of a user: ASCII alphanumerics, `-`, `_` and non-leading
/// `.` are kept, every other byte becomes `%XX`. Distinct ids never share a
/// directory and the name is always one path component below the root.
fn dir_name(user_id: &str) -> String {
    let mut name = String::with_capacity(user_id.len());
    for (i, byte) in user_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

#[async_trait]
impl EventStore for AuditStore {
    fn kind(&self) -> &str {
        "audit"
    }

    async fn get_streams(&self, user_id: &str, query: &StreamsQuery) -> Result<Vec<Stream>> {
        let mut seen = HashSet::new();
        let mut flat = Vec::new();
        for event in self.read_all(user_id).await? {
            for id in event.stream_ids {
                if seen.insert(id.clone()) {
                    flat.push(Stream {
                        name: id.clone(),
                        id,
                        ..Default::default()
                    });
                }
            }
        }
        select_streams(flat, query)
    }

    async fn get_events_streamed(&self, user_id: &str, query: &EventsQuery) -> Result<EventStream> {
        let matcher = Matcher::new(query);
        if !matcher.can_match() {
            return Ok(stream::empty().boxed());
        }
        let Some(lines) = self.open_lines(user_id).await? else {
            return Ok(stream::empty().boxed());
        };
        let remaining = query.limit.unwrap_or(usize::MAX);
        Ok(stream::unfold(
            (lines, matcher, remaining),
            |(mut lines, matcher, remaining)| async move {
                if remaining == 0 {
                    return None;
                }
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => return None,
                        Err(e) => return Some((Err(FederationError::from(e)), (lines, matcher, 0))),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Event>(&line) {
                        Ok(event) if matcher.matches(&event) => {
                            return Some((Ok(event), (lines, matcher, remaining - 1)));
                        }
                        Ok(_) => {}
                        Err(e) => return Some((Err(FederationError::from(e)), (lines, matcher, 0))),
                    }
                }
            },
        )
        .boxed())
    }

    async fn create_event(&self, user_id: &str, event: Event) -> Result<Event> {
        let event = stamp_new_event(event, user_id);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let dir = self.user_dir(user_id)?;
        let _guard = self.append_lock.lock().await;
        fs::create_dir_all(&dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(AUDIT_FILE_NAME))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(user = user_id, id = %event.id, "audit record appended");
        Ok(event)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let dir = self.user_dir(user_id)?;
        let _guard = self.append_lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_storage_infos(&self, user_id: &str) -> Result<StorageInfos> {
        let size_bytes = match fs::metadata(self.log_path(user_id)?).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == IoErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let events = self.read_all(user_id).await?;
        let streams: HashSet<&str> = events
            .iter()
            .flat_map(|e| e.stream_ids.iter().map(String::as_str))
            .collect();
        Ok(StorageInfos {
            size_bytes,
            event_count: events.len() as u64,
            stream_count: streams.len() as u64,
        })
    }
}
