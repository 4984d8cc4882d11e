//! Concrete backends behind the [`EventStore`] capability interface.

pub mod audit;
pub mod faulty;
pub mod memory;
pub mod sqlite;

use crate::core::cache::StoreCache;
use crate::core::config::{BackendConfig, BackendKind, Config};
use crate::core::error::{FederationError, Result};
use crate::core::federation::Federation;
use crate::core::schemas::EVENTS_DB_NAME;
use crate::core::store::EventStore;
use std::sync::Arc;

/// Build the store for one configured backend.
pub fn open_store(backend: &BackendConfig, config: &Config) -> Result<Arc<dyn EventStore>> {
    let path = || {
        backend.path.as_deref().ok_or_else(|| {
            FederationError::Config(format!("backend '{}' requires a path", backend.id))
        })
    };
    let store: Arc<dyn EventStore> = match backend.kind {
        BackendKind::Sqlite => {
            // A directory path gets the default database file name.
            let path = path()?;
            let db_path = if path.extension().is_none() {
                path.join(EVENTS_DB_NAME)
            } else {
                path.to_path_buf()
            };
            Arc::new(sqlite::SqliteStore::open(&db_path, config)?)
        }
        BackendKind::Audit => Arc::new(audit::AuditStore::new(path()?)),
        BackendKind::Memory => Arc::new(memory::MemoryStore::new()),
        BackendKind::Faulty => Arc::new(faulty::FaultyStore),
    };
    Ok(store)
}

/// Open every configured backend and register it, in configuration order.
pub fn boot(config: &Config) -> Result<Federation> {
    config.validate()?;
    let mut federation = Federation::new(&config.default_backend, Arc::new(StoreCache::new()));
    for backend in &config.backends {
        let store = open_store(backend, config)?;
        federation.register(&backend.id, &backend.name, backend.mandatory, store)?;
    }
    Ok(federation)
}
