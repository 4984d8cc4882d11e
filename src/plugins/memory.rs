//! In-process store for plugin-style backends and tests.

use crate::core::compile::{Compiled, MemoryDialect, Predicate, compile};
use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use crate::core::store::{
    EventStore, EventStream, select_streams, stamp_new_event, tombstone,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Compiled form of an [`EventsQuery`] for evaluation against loaded events.
pub(crate) struct Matcher {
    streams: Option<Compiled<Predicate>>,
    query: EventsQuery,
}

impl Matcher {
    pub(crate) fn new(query: &EventsQuery) -> Self {
        Matcher {
            streams: compile(&query.streams, &MemoryDialect),
            query: query.clone(),
        }
    }

    /// False when the stream query can match nothing at all.
    pub(crate) fn can_match(&self) -> bool {
        self.streams.is_some()
    }

    pub(crate) fn matches(&self, event: &Event) -> bool {
        let in_streams = match &self.streams {
            None => false,
            // Deleted records have no streams left; the stream filter only
            // applies to live ones.
            Some(_) if event.deleted.is_some() => true,
            Some(compiled) => compiled.matches(&event.stream_ids),
        };
        in_streams && self.query.accepts(event)
    }
}

#[derive(Default)]
struct UserData {
    events: Vec<Event>,
    streams: Vec<Stream>,
}

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, UserData>>> {
        self.users
            .read()
            .map_err(|_| FederationError::Config("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, UserData>>> {
        self.users
            .write()
            .map_err(|_| FederationError::Config("memory store lock poisoned".to_string()))
    }

    fn select(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        let matcher = Matcher::new(query);
        if !matcher.can_match() {
            return Ok(Vec::new());
        }
        let users = self.read()?;
        let mut events: Vec<Event> = users
            .get(user_id)
            .map(|data| {
                data.events
                    .iter()
                    .filter(|e| matcher.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by(|a, b| {
            let (ta, tb) = (a.time.unwrap_or(0.0), b.time.unwrap_or(0.0));
            if query.sort_ascending {
                ta.total_cmp(&tb)
            } else {
                tb.total_cmp(&ta)
            }
        });
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn get_streams(&self, user_id: &str, query: &StreamsQuery) -> Result<Vec<Stream>> {
        let flat = self
            .read()?
            .get(user_id)
            .map(|data| data.streams.clone())
            .unwrap_or_default();
        select_streams(flat, query)
    }

    async fn create_stream(&self, user_id: &str, mut stream: Stream) -> Result<Stream> {
        if stream.id.is_empty() {
            stream.id = crate::core::time::new_event_id();
        }
        stream.children.clear();
        let mut users = self.write()?;
        let data = users.entry(user_id.to_string()).or_default();
        if data.streams.iter().any(|s| s.id == stream.id) {
            return Err(FederationError::Conflict(format!("stream '{}'", stream.id)));
        }
        data.streams.push(stream.clone());
        Ok(stream)
    }

    async fn get_events_streamed(&self, user_id: &str, query: &EventsQuery) -> Result<EventStream> {
        let events = self.select(user_id, query)?;
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn get_events(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        self.select(user_id, query)
    }

    async fn create_event(&self, user_id: &str, event: Event) -> Result<Event> {
        let event = stamp_new_event(event, user_id);
        let mut users = self.write()?;
        let data = users.entry(user_id.to_string()).or_default();
        if data.events.iter().any(|e| e.id == event.id) {
            return Err(FederationError::Conflict(format!("event '{}'", event.id)));
        }
        data.events.push(event.clone());
        Ok(event)
    }

    async fn delete_event(&self, user_id: &str, event_id: &str) -> Result<Event> {
        let mut users = self.write()?;
        let stored = users
            .get_mut(user_id)
            .and_then(|data| data.events.iter_mut().find(|e| e.id == event_id))
            .ok_or_else(|| FederationError::NotFound(format!("event '{event_id}'")))?;
        if stored.deleted.is_none() {
            *stored = tombstone(stored);
        }
        Ok(stored.clone())
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.write()?.remove(user_id);
        Ok(())
    }

    async fn get_storage_infos(&self, user_id: &str) -> Result<StorageInfos> {
        let users = self.read()?;
        let Some(data) = users.get(user_id) else {
            return Ok(StorageInfos::default());
        };
        let size_bytes = data
            .events
            .iter()
            .map(|e| serde_json::to_vec(e).map(|v| v.len() as u64))
            .sum::<std::result::Result<u64, _>>()?;
        Ok(StorageInfos {
            size_bytes,
            event_count: data.events.len() as u64,
            stream_count: data.streams.len() as u64,
        })
    }
}
