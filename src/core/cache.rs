//! Explicit cache handed to the coordinator at construction.
//!
//! Entries are keyed by (namespace, key); the coordinator uses the backend id
//! as namespace and the user id as key. The cache lives as long as the
//! backend registry and is emptied by `clear` at shutdown.

use crate::core::error::{FederationError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct StoreCache<V> {
    entries: Mutex<HashMap<(String, String), Arc<V>>>,
}

impl<V> Default for StoreCache<V> {
    fn default() -> Self {
        StoreCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> StoreCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Arc<V>>>> {
        self.entries
            .lock()
            .map_err(|_| FederationError::Config("StoreCache lock poisoned".to_string()))
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Arc<V>>> {
        Ok(self
            .lock()?
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    pub fn put(&self, namespace: &str, key: &str, value: V) -> Result<Arc<V>> {
        let value = Arc::new(value);
        self.lock()?
            .insert((namespace.to_string(), key.to_string()), Arc::clone(&value));
        Ok(value)
    }

    pub fn invalidate(&self, namespace: &str, key: &str) -> Result<()> {
        self.lock()?
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    /// Drop every entry for `key`, whatever the namespace.
    pub fn invalidate_key(&self, key: &str) -> Result<()> {
        self.lock()?.retain(|(_, k), _| k != key);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
