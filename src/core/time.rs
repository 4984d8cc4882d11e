//! Shared timestamp/id helpers for stored records.

use ulid::Ulid;

/// Unix-epoch seconds with sub-second precision, the unit of every event time.
pub fn now_epoch() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string().to_lowercase()
}
