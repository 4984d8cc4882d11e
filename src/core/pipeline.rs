//! Per-caller filter stages applied to coordinator output.
//!
//! A stage consumes one event and yields zero or one event. Stages compose
//! into a [`Pipeline`], which runs them over an [`EventStream`] item by item:
//! the next upstream event is only pulled once the previous result has been
//! taken downstream, so backpressure reaches the backends unchanged.

use crate::core::model::{Event, PermissionSet};
use crate::core::store::EventStream;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

pub type Stage = Box<dyn FnMut(Event) -> Option<Event> + Send>;

type HmacSha256 = Hmac<Sha256>;

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run one event through every stage, stopping at the first drop.
    pub fn apply(&mut self, event: Event) -> Option<Event> {
        self.stages
            .iter_mut()
            .try_fold(event, |event, stage| stage(event))
    }

    /// Apply the pipeline lazily to a stream. Errors pass through untouched.
    pub fn run(mut self, events: EventStream) -> EventStream {
        events
            .filter_map(move |item| {
                let out = match item {
                    Ok(event) => self.apply(event).map(Ok),
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(out)
            })
            .boxed()
    }

    /// Standard delivery order: permissions, legacy `streamId`, deletion
    /// minimization, attachment read tokens.
    pub fn for_caller(perms: Arc<PermissionSet>, secret: &str) -> Self {
        Pipeline::new()
            .then(permission_filter(Arc::clone(&perms)))
            .then(legacy_stream_id())
            .then(minimize_deleted())
            .then(attachment_tokens(perms, secret))
    }
}

/// Restrict `streamIds` to what the caller may read; drop events left with
/// none. Tombstones carry no streams and pass as they are.
pub fn permission_filter(perms: Arc<PermissionSet>) -> Stage {
    Box::new(move |mut event| {
        if event.stream_ids.is_empty() {
            return event.deleted.is_some().then_some(event);
        }
        if event.stream_ids.len() == 1 {
            let readable = perms.can_read(&event.stream_ids[0]);
            return readable.then_some(event);
        }
        event.stream_ids.retain(|id| perms.can_read(id));
        (!event.stream_ids.is_empty()).then_some(event)
    })
}

/// Fill the deprecated single `streamId` from the first stream id.
pub fn legacy_stream_id() -> Stage {
    Box::new(|mut event| {
        event.stream_id = event.stream_ids.first().cloned();
        Some(event)
    })
}

/// Reduce deleted events to `{id, deleted}`, keeping `integrity` only when
/// the stored record still holds its content.
pub fn minimize_deleted() -> Stage {
    Box::new(|event| {
        if event.deleted.is_none() {
            return Some(event);
        }
        let integrity = if event.has_body() {
            event.integrity.clone()
        } else {
            None
        };
        Some(Event {
            id: event.id,
            deleted: event.deleted,
            integrity,
            ..Default::default()
        })
    })
}

/// Attach a per-response read token to every attachment when the caller is
/// allowed to fetch attachments.
pub fn attachment_tokens(perms: Arc<PermissionSet>, secret: &str) -> Stage {
    let secret = secret.as_bytes().to_vec();
    Box::new(move |mut event| {
        if perms.attachments {
            for attachment in &mut event.attachments {
                attachment.read_token = read_token(&secret, &attachment.id, &perms.access_id);
            }
        }
        Some(event)
    })
}

/// `<accessId>-<hex hmac>` over the attachment id and access id, each
/// prefixed with its byte length.
pub fn read_token(secret: &[u8], attachment_id: &str, access_id: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    for part in [attachment_id, access_id] {
        mac.update(&(part.len() as u64).to_be_bytes());
        mac.update(part.as_bytes());
    }
    Some(format!("{access_id}-{:x}", mac.finalize().into_bytes()))
}
