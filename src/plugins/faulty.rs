//! Placeholder backend for a store whose plugin failed to load.
//!
//! It keeps the namespace reserved while every capability call reports
//! `NotSupported`.

use crate::core::store::EventStore;
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct FaultyStore;

#[async_trait]
impl EventStore for FaultyStore {
    fn kind(&self) -> &str {
        "faulty"
    }
}
