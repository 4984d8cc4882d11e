use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use crate::core::store::{EventStore, EventStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// The Store Broker is the "Thin Waist" between the coordinator and one backend.
///
/// It is itself an [`EventStore`]: every capability call is logged with its
/// outcome, and raw storage errors (SQLite, I/O, JSON) are reclassified as
/// `BackendUnavailable` for this backend, on call results and on every item
/// of a returned event stream. Already classified errors pass through.
pub struct StoreBroker {
    backend_id: String,
    inner: Arc<dyn EventStore>,
}

impl StoreBroker {
    pub fn new(backend_id: &str, inner: Arc<dyn EventStore>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            inner,
        }
    }

    fn classify(backend_id: &str, err: FederationError) -> FederationError {
        if err.is_raw_storage() {
            FederationError::BackendUnavailable {
                backend: backend_id.to_string(),
                message: err.to_string(),
            }
        } else {
            err
        }
    }

    fn log<R>(&self, op: &str, result: Result<R>) -> Result<R> {
        let result = result.map_err(|e| Self::classify(&self.backend_id, e));
        match &result {
            Ok(_) => debug!(
                backend = %self.backend_id,
                op,
                status = "success",
                "capability call"
            ),
            Err(e) => debug!(
                backend = %self.backend_id,
                op,
                status = "error",
                kind = ?e.kind(),
                error = %e,
                "capability call"
            ),
        }
        result
    }
}

#[async_trait]
impl EventStore for StoreBroker {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    async fn get_streams(&self, user_id: &str, query: &StreamsQuery) -> Result<Vec<Stream>> {
        self.log("streams.get", self.inner.get_streams(user_id, query).await)
    }

    async fn create_stream(&self, user_id: &str, stream: Stream) -> Result<Stream> {
        self.log(
            "streams.create",
            self.inner.create_stream(user_id, stream).await,
        )
    }

    async fn get_events_streamed(&self, user_id: &str, query: &EventsQuery) -> Result<EventStream> {
        let stream = self.log(
            "events.getStreamed",
            self.inner.get_events_streamed(user_id, query).await,
        )?;
        let backend_id = self.backend_id.clone();
        Ok(stream
            .map(move |item| item.map_err(|e| Self::classify(&backend_id, e)))
            .boxed())
    }

    async fn get_events(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        self.log("events.get", self.inner.get_events(user_id, query).await)
    }

    async fn create_event(&self, user_id: &str, event: Event) -> Result<Event> {
        self.log(
            "events.create",
            self.inner.create_event(user_id, event).await,
        )
    }

    async fn delete_event(&self, user_id: &str, event_id: &str) -> Result<Event> {
        self.log(
            "events.delete",
            self.inner.delete_event(user_id, event_id).await,
        )
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.log("deleteUser", self.inner.delete_user(user_id).await)
    }

    async fn get_storage_infos(&self, user_id: &str) -> Result<StorageInfos> {
        self.log(
            "getStorageInfos",
            self.inner.get_storage_infos(user_id).await,
        )
    }
}
