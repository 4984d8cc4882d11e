//! Event, stream and attachment records exchanged with every backend.
//!
//! Optional fields are skipped on the wire, so a record carrying only `id` and
//! `deleted` serializes to exactly that shape.

use crate::core::query::{StreamQuery, WILDCARD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Computed per response; never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_ids: Vec<String>,
    /// Deprecated single-stream shape kept for older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
}

impl Event {
    /// True when anything beyond `id`, `deleted` and `integrity` is set.
    pub fn has_body(&self) -> bool {
        !self.stream_ids.is_empty()
            || self.stream_id.is_some()
            || self.event_type.is_some()
            || self.time.is_some()
            || self.duration.is_some()
            || self.content.is_some()
            || self.description.is_some()
            || !self.attachments.is_empty()
            || self.trashed.is_some()
            || self.created.is_some()
            || self.created_by.is_some()
            || self.modified.is_some()
            || self.modified_by.is_some()
    }

    /// `EVENT:0:sha256-<hex>` over the canonical JSON of the stored shape.
    ///
    /// The legacy `streamId`, attachment read tokens and the digest itself
    /// are excluded so the value is stable across responses.
    pub fn compute_integrity(&self) -> String {
        let mut stored = self.clone();
        stored.integrity = None;
        stored.stream_id = None;
        for attachment in &mut stored.attachments {
            attachment.read_token = None;
        }
        // serde_json::Value sorts object keys, which gives a canonical form.
        let canonical = serde_json::to_value(&stored)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("EVENT:0:sha256-{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_indexed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_unique: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_shown: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Stream>,
}

impl Stream {
    /// Arrange a flat list into trees, keeping input order among siblings.
    /// Streams whose parent is not in the list become roots.
    pub fn into_tree(flat: Vec<Stream>) -> Vec<Stream> {
        let known: HashSet<String> = flat.iter().map(|s| s.id.clone()).collect();
        let (roots, mut rest): (Vec<Stream>, Vec<Stream>) = flat.into_iter().partition(|s| {
            s.parent_id
                .as_ref()
                .is_none_or(|parent| !known.contains(parent))
        });
        roots
            .into_iter()
            .map(|root| Self::attach_children(root, &mut rest))
            .collect()
    }

    fn attach_children(mut node: Stream, pool: &mut Vec<Stream>) -> Stream {
        let (children, remaining): (Vec<Stream>, Vec<Stream>) = std::mem::take(pool)
            .into_iter()
            .partition(|s| s.parent_id.as_deref() == Some(node.id.as_str()));
        *pool = remaining;
        node.children = children
            .into_iter()
            .map(|child| Self::attach_children(child, pool))
            .collect();
        node
    }

    /// Depth-first visit of this stream and all descendants.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Stream)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfos {
    pub size_bytes: u64,
    pub event_count: u64,
    pub stream_count: u64,
}

/// Parameters for `events.get` / `events.getStreamed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventsQuery {
    pub streams: StreamQuery,
    pub from_time: Option<f64>,
    pub to_time: Option<f64>,
    pub types: Vec<String>,
    pub limit: Option<usize>,
    pub include_deletions: bool,
    pub sort_ascending: bool,
}

impl EventsQuery {
    pub fn for_streams(streams: StreamQuery) -> Self {
        EventsQuery {
            streams,
            ..Default::default()
        }
    }

    /// Non-stream filters (time window, types, deletions).
    pub fn accepts(&self, event: &Event) -> bool {
        if event.deleted.is_some() && !self.include_deletions {
            return false;
        }
        if let (Some(from), Some(time)) = (self.from_time, event.time)
            && time < from
        {
            return false;
        }
        if let (Some(to), Some(time)) = (self.to_time, event.time)
            && time > to
        {
            return false;
        }
        if !self.types.is_empty() {
            match &event.event_type {
                Some(t) if self.types.contains(t) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsQuery {
    pub parent_id: Option<String>,
    pub include_trashed: bool,
}

/// Caller-resolved read access, computed by the access-control layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub access_id: String,
    pub readable: HashSet<String>,
    pub attachments: bool,
}

impl PermissionSet {
    pub fn new(access_id: &str, readable: impl IntoIterator<Item = impl Into<String>>) -> Self {
        PermissionSet {
            access_id: access_id.to_string(),
            readable: readable.into_iter().map(Into::into).collect(),
            attachments: false,
        }
    }

    pub fn with_attachments(mut self) -> Self {
        self.attachments = true;
        self
    }

    /// `*` in the readable set grants every stream.
    pub fn can_read(&self, stream_id: &str) -> bool {
        self.readable.contains(stream_id) || self.readable.contains(WILDCARD)
    }
}
