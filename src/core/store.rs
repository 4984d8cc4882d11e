//! Capability interface implemented by every backend.
//!
//! Every method has a default body that fails with `NotSupported`, so a
//! backend that only offers part of the surface is still dispatchable and
//! callers can tell "unsupported" apart from "empty".

use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;

/// Lazy, finite, non-restartable sequence of events.
pub type EventStream = BoxStream<'static, Result<Event>>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Backend kind, used in `NotSupported` errors raised by the defaults.
    fn kind(&self) -> &str;

    async fn get_streams(&self, _user_id: &str, _query: &StreamsQuery) -> Result<Vec<Stream>> {
        Err(FederationError::not_supported(self.kind(), "streams.get"))
    }

    async fn create_stream(&self, _user_id: &str, _stream: Stream) -> Result<Stream> {
        Err(FederationError::not_supported(self.kind(), "streams.create"))
    }

    async fn get_events_streamed(
        &self,
        _user_id: &str,
        _query: &EventsQuery,
    ) -> Result<EventStream> {
        Err(FederationError::not_supported(self.kind(), "events.getStreamed"))
    }

    async fn get_events(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        self.get_events_streamed(user_id, query)
            .await?
            .try_collect()
            .await
    }

    async fn create_event(&self, _user_id: &str, _event: Event) -> Result<Event> {
        Err(FederationError::not_supported(self.kind(), "events.create"))
    }

    /// Mark an event deleted and return its tombstone.
    async fn delete_event(&self, _user_id: &str, _event_id: &str) -> Result<Event> {
        Err(FederationError::not_supported(self.kind(), "events.delete"))
    }

    async fn delete_user(&self, _user_id: &str) -> Result<()> {
        Err(FederationError::not_supported(self.kind(), "deleteUser"))
    }

    async fn get_storage_infos(&self, _user_id: &str) -> Result<StorageInfos> {
        Err(FederationError::not_supported(self.kind(), "getStorageInfos"))
    }
}

/// Fill in the fields a backend stamps when storing a new event.
pub fn stamp_new_event(mut event: Event, user_id: &str) -> Event {
    if event.id.is_empty() {
        event.id = crate::core::time::new_event_id();
    }
    let now = crate::core::time::now_epoch();
    event.time.get_or_insert(now);
    event.created.get_or_insert(now);
    event.created_by.get_or_insert_with(|| user_id.to_string());
    event.modified = event.created;
    event.modified_by = event.created_by.clone();
    event.stream_id = None;
    event.integrity = Some(event.compute_integrity());
    event
}

/// Reduce an event to its stored tombstone: id and deletion time only.
pub fn tombstone(event: &Event) -> Event {
    Event {
        id: event.id.clone(),
        deleted: Some(crate::core::time::now_epoch()),
        ..Default::default()
    }
}

/// Adapt the receiving half of a bounded channel into an [`EventStream`].
///
/// Dropping the stream drops the receiver, which makes the producer's next
/// send fail: that is how a blocking producer learns the caller went away.
pub fn channel_stream(rx: mpsc::Receiver<Result<Event>>) -> EventStream {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Shape a flat stream list into the tree a `streams.get` call returns.
pub fn select_streams(flat: Vec<Stream>, query: &StreamsQuery) -> Result<Vec<Stream>> {
    let flat: Vec<Stream> = flat
        .into_iter()
        .filter(|s| query.include_trashed || s.trashed != Some(true))
        .collect();
    let tree = Stream::into_tree(flat);
    let Some(parent_id) = &query.parent_id else {
        return Ok(tree);
    };
    let mut found = None;
    for mut root in tree {
        root.for_each_mut(&mut |s| {
            if found.is_none() && &s.id == parent_id {
                found = Some(std::mem::take(&mut s.children));
            }
        });
    }
    found.ok_or_else(|| FederationError::NotFound(format!("stream '{parent_id}'")))
}
