//! Process configuration, loaded from a TOML file.
//!
//! ```toml
//! default_backend = "local"
//!
//! [[backends]]
//! id = "local"
//! name = "Local"
//! kind = "sqlite"
//! path = "data/events.db"
//! mandatory = true
//!
//! [[backends]]
//! id = "audit"
//! name = "Audit"
//! kind = "audit"
//! path = "data/audit"
//!
//! [retry]
//! max_attempts = 21
//!
//! [attachments]
//! secret = "change-me"
//! ```

use crate::core::error::{FederationError, Result};
use crate::core::namespace::SEPARATOR;
use crate::core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Audit,
    Memory,
    Faulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// A failing mandatory backend fails the whole fan-out query.
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            busy_timeout_ms: 100,
        }
    }
}

impl SqliteConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Events buffered between a blocking producer and its consumer.
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentsConfig {
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_backend: String,
    pub backends: Vec<BackendConfig>,
    pub retry: RetryPolicy,
    pub sqlite: SqliteConfig,
    pub streaming: StreamingConfig,
    pub attachments: AttachmentsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_backend: "local".to_string(),
            backends: Vec::new(),
            retry: RetryPolicy::default(),
            sqlite: SqliteConfig::default(),
            streaming: StreamingConfig::default(),
            attachments: AttachmentsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a TOML config. Relative backend paths resolve
    /// against the config file's directory.
    pub fn load(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| FederationError::Config(format!("{}: {e}", path.display())))?;
        if let Some(base) = path.parent() {
            for backend in &mut config.backends {
                if let Some(p) = backend.path.as_mut()
                    && p.is_relative()
                {
                    *p = base.join(&*p);
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() || backend.id.contains(SEPARATOR) {
                return Err(FederationError::Config(format!(
                    "backend id '{}' must be non-empty and must not contain '{SEPARATOR}'",
                    backend.id
                )));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(FederationError::Config(format!(
                    "backend id '{}' is configured twice",
                    backend.id
                )));
            }
            let needs_path = matches!(backend.kind, BackendKind::Sqlite | BackendKind::Audit);
            if needs_path && backend.path.is_none() {
                return Err(FederationError::Config(format!(
                    "backend '{}' requires a path",
                    backend.id
                )));
            }
        }
        if !self.backends.is_empty() && !seen.contains(self.default_backend.as_str()) {
            return Err(FederationError::Config(format!(
                "default backend '{}' is not configured",
                self.default_backend
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(FederationError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(FederationError::Config(
                "streaming.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
