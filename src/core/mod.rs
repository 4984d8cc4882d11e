//! Shared primitives of the federation layer.
//!
//! Query algebra and compilation, identifier namespacing, the coordinator,
//! the per-caller pipeline and the storage plumbing used by the backends.

pub mod broker;
pub mod cache;
pub mod compile;
pub mod config;
pub mod db;
pub mod error;
pub mod federation;
pub mod model;
pub mod namespace;
pub mod pipeline;
pub mod pool;
pub mod query;
pub mod retry;
pub mod schemas;
pub mod store;
pub mod time;
pub mod wire;
