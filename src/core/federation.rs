//! Federation coordinator: one query surface over every registered backend.
//!
//! The registry is filled at boot through `register` (which needs `&mut self`)
//! and is read-only afterwards; callers share the coordinator behind an `Arc`.
//!
//! A query scoped to one backend (explicitly through `storeId`, or implicitly
//! because every stream id carries that backend's namespace) goes to that
//! backend alone. Otherwise it fans out to all backends concurrently and the
//! branches are interleaved as their events arrive. There is no ordering
//! across branches; each branch keeps its backend's order.
//!
//! Only `BackendUnavailable` is isolated: an optional backend raising it is
//! logged and left out, a mandatory one turns it into
//! `FederationPartialFailure`. Every other error kind reaches the caller as it
//! is.

use crate::core::broker::StoreBroker;
use crate::core::cache::StoreCache;
use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, EventsQuery, StorageInfos, Stream, StreamsQuery};
use crate::core::namespace::{Namespacer, SEPARATOR};
use crate::core::query::StreamQuery;
use crate::core::store::{EventStore, EventStream};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Backend {
    pub id: String,
    pub name: String,
    pub mandatory: bool,
    store: StoreBroker,
}

impl Backend {
    /// What a failure of this backend means for a multi-backend call: `None`
    /// when it is isolated, otherwise the error to report.
    fn escalate(&self, err: FederationError) -> Option<FederationError> {
        match err {
            FederationError::BackendUnavailable { .. } if self.mandatory => {
                Some(FederationError::FederationPartialFailure {
                    backend: self.id.clone(),
                    message: err.to_string(),
                })
            }
            FederationError::BackendUnavailable { .. } => {
                warn!(
                    backend = %self.id,
                    name = %self.name,
                    error = %err,
                    "backend isolated"
                );
                None
            }
            other => Some(other),
        }
    }
}

/// Where a stream query goes once namespaces are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// One backend, with stream ids translated to its local ids.
    Scoped {
        backend_id: String,
        query: StreamQuery,
    },
    FanOut(StreamQuery),
}

pub struct Federation {
    namespacer: Arc<Namespacer>,
    backends: Vec<Arc<Backend>>,
    streams_cache: Arc<StoreCache<Vec<Stream>>>,
}

impl Federation {
    pub fn new(default_backend: &str, streams_cache: Arc<StoreCache<Vec<Stream>>>) -> Self {
        Federation {
            namespacer: Arc::new(Namespacer::new(default_backend)),
            backends: Vec::new(),
            streams_cache,
        }
    }

    pub fn register(
        &mut self,
        backend_id: &str,
        name: &str,
        mandatory: bool,
        store: Arc<dyn EventStore>,
    ) -> Result<()> {
        Arc::make_mut(&mut self.namespacer).register(backend_id)?;
        info!(
            backend = backend_id,
            name,
            kind = store.kind(),
            mandatory,
            "backend registered"
        );
        self.backends.push(Arc::new(Backend {
            id: backend_id.to_string(),
            name: name.to_string(),
            mandatory,
            store: StoreBroker::new(backend_id, store),
        }));
        Ok(())
    }

    pub fn namespacer(&self) -> &Namespacer {
        &self.namespacer
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn backend(&self, backend_id: &str) -> Result<&Backend> {
        self.backends
            .iter()
            .find(|b| b.id == backend_id)
            .map(Arc::as_ref)
            .ok_or_else(|| FederationError::UnknownNamespace(backend_id.to_string()))
    }

    /// Decide which backend(s) a stream query targets.
    pub fn resolve(&self, query: &StreamQuery) -> Result<Dispatch> {
        let mut namespaces = BTreeSet::new();
        let mut bare = false;
        for id in query.stream_ids() {
            if id.starts_with(SEPARATOR) {
                namespaces.insert(self.namespacer.unprefix(id)?.backend_id);
            } else {
                bare = true;
            }
        }

        let target = match &query.store_id {
            Some(store_id) => {
                self.backend(store_id)?;
                if let Some(other) = namespaces.iter().find(|ns| *ns != store_id) {
                    return Err(FederationError::QueryMalformed(format!(
                        "storeId '{store_id}' conflicts with stream namespace '{other}'"
                    )));
                }
                store_id.clone()
            }
            None if namespaces.is_empty() => return Ok(Dispatch::FanOut(query.clone())),
            None if namespaces.len() == 1 && !bare => {
                namespaces.into_iter().next().unwrap_or_default()
            }
            None => {
                return Err(FederationError::QueryMalformed(
                    "stream ids from several backends cannot be mixed in one query".to_string(),
                ));
            }
        };

        let mut local = query.map_ids(|id| Ok(self.namespacer.unprefix(id)?.local_id))?;
        local.store_id = Some(target.clone());
        Ok(Dispatch::Scoped {
            backend_id: target,
            query: local,
        })
    }

    /// Lazily stream every matching event, namespaced.
    pub async fn query(&self, user_id: &str, query: &EventsQuery) -> Result<EventStream> {
        match self.resolve(&query.streams)? {
            Dispatch::Scoped {
                backend_id,
                query: local,
            } => {
                let backend = self.backend(&backend_id)?;
                let scoped = EventsQuery {
                    streams: local,
                    ..query.clone()
                };
                debug!(backend = %backend_id, user = user_id, "scoped query");
                let events = backend.store.get_events_streamed(user_id, &scoped).await?;
                let namespacer = Arc::clone(&self.namespacer);
                let prefixed = events
                    .map(move |item| {
                        item.map(|mut event| {
                            namespacer.prefix_event(&backend_id, &mut event);
                            event
                        })
                    })
                    .boxed();
                Ok(fail_fast(prefixed))
            }
            Dispatch::FanOut(streams) => {
                let fanned = EventsQuery {
                    streams,
                    ..query.clone()
                };
                debug!(
                    user = user_id,
                    backends = self.backends.len(),
                    "fan-out query"
                );
                let opened = join_all(self.backends.iter().map(|backend| {
                    let fanned = &fanned;
                    async move {
                        let result = backend.store.get_events_streamed(user_id, fanned).await;
                        (backend, result)
                    }
                }))
                .await;

                let mut branches = Vec::with_capacity(opened.len());
                for (backend, result) in opened {
                    match result {
                        Ok(events) => branches.push(self.branch(Arc::clone(backend), events)),
                        Err(e) => {
                            if let Some(e) = backend.escalate(e) {
                                return Err(e);
                            }
                        }
                    }
                }
                Ok(fail_fast(stream::select_all(branches).boxed()))
            }
        }
    }

    /// Collecting variant of [`Federation::query`].
    pub async fn get_events(&self, user_id: &str, query: &EventsQuery) -> Result<Vec<Event>> {
        let mut stream = self.query(user_id, query).await?;
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item?);
        }
        Ok(events)
    }

    /// One backend's share of a fan-out: namespaced events until the first
    /// error, which ends the branch. An isolated error ends it silently; any
    /// other is delivered first.
    fn branch(&self, backend: Arc<Backend>, events: EventStream) -> EventStream {
        let namespacer = Arc::clone(&self.namespacer);
        stream::unfold(Some(events), move |state| {
            let namespacer = Arc::clone(&namespacer);
            let backend = Arc::clone(&backend);
            async move {
                let mut inner = state?;
                match inner.next().await? {
                    Ok(mut event) => {
                        namespacer.prefix_event(&backend.id, &mut event);
                        Some((Ok(event), Some(inner)))
                    }
                    Err(e) => backend.escalate(e).map(|e| (Err(e), None)),
                }
            }
        })
        .boxed()
    }

    /// Stream trees of the targeted backend(s), namespaced.
    pub async fn get_streams(
        &self,
        user_id: &str,
        query: &StreamsQuery,
        store_id: Option<&str>,
    ) -> Result<Vec<Stream>> {
        let mut local = query.clone();
        let targets: Vec<&Backend> = match (store_id, &query.parent_id) {
            (Some(store_id), _) => vec![self.backend(store_id)?],
            (None, Some(parent)) => {
                let owner = self.namespacer.unprefix(parent)?;
                local.parent_id = Some(owner.local_id);
                vec![self.backend(&owner.backend_id)?]
            }
            (None, None) => self.backends.iter().map(Arc::as_ref).collect(),
        };
        let scoped = targets.len() == 1;

        let mut out = Vec::new();
        for backend in targets {
            let streams = match self.backend_streams(backend, user_id, &local).await {
                Ok(streams) => streams,
                Err(e) if scoped => return Err(e),
                Err(e) => match backend.escalate(e) {
                    Some(e) => return Err(e),
                    None => continue,
                },
            };
            for mut tree in streams.iter().cloned() {
                self.namespacer.prefix_stream(&backend.id, &mut tree);
                out.push(tree);
            }
        }
        Ok(out)
    }

    async fn backend_streams(
        &self,
        backend: &Backend,
        user_id: &str,
        query: &StreamsQuery,
    ) -> Result<Arc<Vec<Stream>>> {
        let cacheable = *query == StreamsQuery::default();
        if cacheable && let Some(hit) = self.streams_cache.get(&backend.id, user_id)? {
            return Ok(hit);
        }
        let streams = backend.store.get_streams(user_id, query).await?;
        if cacheable {
            self.streams_cache.put(&backend.id, user_id, streams)
        } else {
            Ok(Arc::new(streams))
        }
    }

    /// Store an event in the backend owning its streams.
    pub async fn create_event(&self, user_id: &str, mut event: Event) -> Result<Event> {
        let mut owners = BTreeSet::new();
        let mut local_ids = Vec::with_capacity(event.stream_ids.len());
        for id in &event.stream_ids {
            let owner = self.namespacer.unprefix(id)?;
            owners.insert(owner.backend_id);
            local_ids.push(owner.local_id);
        }
        if owners.len() > 1 {
            return Err(FederationError::QueryMalformed(
                "an event cannot belong to streams of several backends".to_string(),
            ));
        }
        let backend_id = owners
            .into_iter()
            .next()
            .unwrap_or_else(|| self.namespacer.default_id().to_string());
        let backend = self.backend(&backend_id)?;
        event.stream_ids = local_ids;
        event.stream_id = None;
        if !event.id.is_empty() {
            event.id = self.namespacer.unprefix(&event.id)?.local_id;
        }

        let mut stored = backend.store.create_event(user_id, event).await?;
        self.streams_cache.invalidate(&backend.id, user_id)?;
        self.namespacer.prefix_event(&backend.id, &mut stored);
        Ok(stored)
    }

    /// Route a deletion to the backend named by the event id's namespace.
    pub async fn delete_event(&self, user_id: &str, event_id: &str) -> Result<Event> {
        let owner = self.namespacer.unprefix(event_id)?;
        let backend = self.backend(&owner.backend_id)?;
        let mut tombstone = backend.store.delete_event(user_id, &owner.local_id).await?;
        self.namespacer.prefix_event(&backend.id, &mut tombstone);
        Ok(tombstone)
    }

    pub async fn create_stream(&self, user_id: &str, mut stream: Stream) -> Result<Stream> {
        let owner = self.namespacer.unprefix(&stream.id)?;
        if let Some(parent) = &stream.parent_id {
            let parent_owner = self.namespacer.unprefix(parent)?;
            if parent_owner.backend_id != owner.backend_id {
                return Err(FederationError::QueryMalformed(
                    "a stream and its parent must live in the same backend".to_string(),
                ));
            }
            stream.parent_id = Some(parent_owner.local_id);
        }
        stream.id = owner.local_id;
        let backend = self.backend(&owner.backend_id)?;
        let mut created = backend.store.create_stream(user_id, stream).await?;
        self.streams_cache.invalidate(&backend.id, user_id)?;
        self.namespacer.prefix_stream(&backend.id, &mut created);
        Ok(created)
    }

    /// Remove a user's data everywhere. Backends without the capability are
    /// skipped; the first other failure is returned after all were attempted.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let results = join_all(self.backends.iter().map(|backend| async move {
            (backend, backend.store.delete_user(user_id).await)
        }))
        .await;
        self.streams_cache.invalidate_key(user_id)?;

        let mut first_error = None;
        for (backend, result) in results {
            match result {
                Ok(()) => {}
                Err(FederationError::NotSupported { .. }) => {
                    debug!(backend = %backend.id, "deleteUser not supported, skipped")
                }
                Err(e) => {
                    warn!(backend = %backend.id, error = %e, "deleteUser failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn storage_infos(&self, user_id: &str) -> Result<BTreeMap<String, StorageInfos>> {
        let mut out = BTreeMap::new();
        for backend in &self.backends {
            match backend.store.get_storage_infos(user_id).await {
                Ok(infos) => {
                    out.insert(backend.id.clone(), infos);
                }
                Err(FederationError::NotSupported { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Release process-lifetime resources.
    pub fn shutdown(&self) -> Result<()> {
        self.streams_cache.clear()?;
        info!(backends = self.backends.len(), "federation shut down");
        Ok(())
    }
}

/// Pass items through until the first error, deliver it, then end. Ending
/// drops the upstream, which closes every branch still open.
fn fail_fast(events: EventStream) -> EventStream {
    stream::unfold(Some(events), |state| async move {
        let mut inner = state?;
        match inner.next().await? {
            Ok(event) => Some((Ok(event), Some(inner))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}
