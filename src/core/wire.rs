//! Streamed JSON array encoding of an event stream.

use crate::core::error::{FederationError, Result};
use crate::core::store::EventStream;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

enum Framing {
    Opening(Option<String>),
    Items,
    Done,
}

/// Encode events as one JSON array, chunk by chunk.
///
/// The first chunk carries `prefix` and the opening `[`; the closing `]`
/// follows the last event. An empty stream yields `prefix` + `[]`. The first
/// error ends the output without a closing bracket.
pub fn json_array(
    events: EventStream,
    prefix: Option<String>,
) -> BoxStream<'static, Result<String>> {
    stream::unfold(
        (events, Framing::Opening(prefix)),
        |(mut events, framing)| async move {
            let opening = match framing {
                Framing::Done => return None,
                Framing::Opening(prefix) => Some(prefix.unwrap_or_default() + "["),
                Framing::Items => None,
            };
            match events.next().await {
                Some(Ok(event)) => {
                    let chunk = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            return Some((Err(FederationError::from(e)), (events, Framing::Done)));
                        }
                    };
                    let chunk = match opening {
                        Some(open) => open + &chunk,
                        None => format!(",{chunk}"),
                    };
                    Some((Ok(chunk), (events, Framing::Items)))
                }
                Some(Err(e)) => Some((Err(e), (events, Framing::Done))),
                None => {
                    let close = opening.unwrap_or_default() + "]";
                    Some((Ok(close), (events, Framing::Done)))
                }
            }
        },
    )
    .boxed()
}
