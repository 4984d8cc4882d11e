//! Backend ownership encoded into event and stream identifiers.
//!
//! Non-default backends expose ids as `:<backend>:<local id>`. The default
//! backend keeps bare ids so existing clients see no change.

use crate::core::error::{FederationError, Result};
use crate::core::model::{Event, Stream};

pub const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaced {
    pub backend_id: String,
    pub local_id: String,
}

#[derive(Debug, Clone)]
pub struct Namespacer {
    default_id: String,
    registered: Vec<String>,
}

impl Namespacer {
    pub fn new(default_id: &str) -> Self {
        Namespacer {
            default_id: default_id.to_string(),
            registered: Vec::new(),
        }
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn is_registered(&self, backend_id: &str) -> bool {
        self.registered.iter().any(|id| id == backend_id)
    }

    /// Reserve a backend id. Ids must be non-empty, free of the separator,
    /// unique, and must not be a prefix of (or prefixed by) another id.
    pub fn register(&mut self, backend_id: &str) -> Result<()> {
        if backend_id.is_empty() || backend_id.contains(SEPARATOR) {
            return Err(FederationError::Config(format!(
                "backend id '{backend_id}' must be non-empty and must not contain '{SEPARATOR}'"
            )));
        }
        if self.is_registered(backend_id) {
            return Err(FederationError::DuplicateBackend(backend_id.to_string()));
        }
        if let Some(clash) = self
            .registered
            .iter()
            .find(|id| id.starts_with(backend_id) || backend_id.starts_with(id.as_str()))
        {
            return Err(FederationError::Config(format!(
                "backend id '{backend_id}' overlaps registered id '{clash}'"
            )));
        }
        self.registered.push(backend_id.to_string());
        Ok(())
    }

    pub fn prefix(&self, backend_id: &str, id: &str) -> String {
        if backend_id == self.default_id {
            id.to_string()
        } else {
            format!("{SEPARATOR}{backend_id}{SEPARATOR}{id}")
        }
    }

    /// Rewrite the event id and every stream id it references.
    pub fn prefix_event(&self, backend_id: &str, event: &mut Event) {
        if backend_id == self.default_id {
            return;
        }
        event.id = self.prefix(backend_id, &event.id);
        for stream_id in &mut event.stream_ids {
            *stream_id = self.prefix(backend_id, stream_id);
        }
        if let Some(stream_id) = event.stream_id.as_mut() {
            *stream_id = self.prefix(backend_id, stream_id);
        }
    }

    /// Rewrite stream and parent ids of a whole stream tree.
    pub fn prefix_stream(&self, backend_id: &str, stream: &mut Stream) {
        if backend_id == self.default_id {
            return;
        }
        stream.for_each_mut(&mut |s| {
            s.id = self.prefix(backend_id, &s.id);
            if let Some(parent) = s.parent_id.as_mut() {
                *parent = self.prefix(backend_id, parent);
            }
        });
    }

    /// Inverse of [`Namespacer::prefix`]. Bare ids belong to the default backend.
    pub fn unprefix(&self, id: &str) -> Result<Namespaced> {
        let Some(rest) = id.strip_prefix(SEPARATOR) else {
            return Ok(Namespaced {
                backend_id: self.default_id.clone(),
                local_id: id.to_string(),
            });
        };
        let (backend_id, local_id) = rest
            .split_once(SEPARATOR)
            .ok_or_else(|| FederationError::UnknownNamespace(id.to_string()))?;
        if !self.is_registered(backend_id) {
            return Err(FederationError::UnknownNamespace(backend_id.to_string()));
        }
        Ok(Namespaced {
            backend_id: backend_id.to_string(),
            local_id: local_id.to_string(),
        })
    }
}
