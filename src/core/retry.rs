//! Retry harness for writes against single-writer stores.
//!
//! Only SQLite `DatabaseBusy` / `DatabaseLocked` failures are retried; every
//! other error is returned untouched on the attempt that raised it. The
//! harness never serializes callers itself: lock ownership stays with the store.

use crate::core::error::{FederationError, Result};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay for exponential backoff; 0 retries immediately.
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 21,
            base_delay_ms: 0,
            max_delay_ms: 1_000,
        }
    }
}

/// A successful write and the attempt it succeeded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<R> {
    pub value: R,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    /// Run `action` until it succeeds, fails with a non-contention error, or
    /// `max_attempts` contention failures have been observed.
    pub fn write_with_retry<F, R>(&self, action: &str, mut f: F) -> Result<Retried<R>>
    where
        F: FnMut() -> Result<R>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            action,
                            attempts = attempt,
                            "write succeeded after contention"
                        );
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) if is_busy_error(&e) => {
                    if attempt >= self.max_attempts {
                        warn!(action, attempts = attempt, "write retries exhausted");
                        return Err(FederationError::RetryExhausted {
                            action: action.to_string(),
                            attempts: self.max_attempts,
                        });
                    }
                    let delay = self.delay(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Check if an error is a SQLite busy/locked error that is retryable.
pub fn is_busy_error(err: &FederationError) -> bool {
    match err {
        FederationError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
