use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Malformed stream query: {0}")]
    QueryMalformed(String),
    #[error("Unknown namespace '{0}'")]
    UnknownNamespace(String),
    #[error("Backend '{0}' is already registered")]
    DuplicateBackend(String),
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },
    #[error("Backend '{backend}' does not support {operation}")]
    NotSupported { backend: String, operation: String },
    #[error("Mandatory backend '{backend}' failed: {message}")]
    FederationPartialFailure { backend: String, message: String },
    #[error("Failed write action {action} after {attempts} retries")]
    RetryExhausted { action: String, attempts: u32 },
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    Conflict(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable classification carried to the boundary in `ErrorPayload::id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    QueryMalformed,
    UnknownNamespace,
    DuplicateBackend,
    BackendUnavailable,
    NotSupported,
    FederationPartialFailure,
    RetryExhausted,
    PermissionDenied,
    UnknownResource,
    ItemAlreadyExists,
    InvalidConfiguration,
    Internal,
}

impl FederationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FederationError::QueryMalformed(_) => ErrorKind::QueryMalformed,
            FederationError::UnknownNamespace(_) => ErrorKind::UnknownNamespace,
            FederationError::DuplicateBackend(_) => ErrorKind::DuplicateBackend,
            FederationError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            FederationError::NotSupported { .. } => ErrorKind::NotSupported,
            FederationError::FederationPartialFailure { .. } => ErrorKind::FederationPartialFailure,
            FederationError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            FederationError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FederationError::NotFound(_) => ErrorKind::UnknownResource,
            FederationError::Conflict(_) => ErrorKind::ItemAlreadyExists,
            FederationError::Config(_) => ErrorKind::InvalidConfiguration,
            FederationError::Sqlite(_) | FederationError::Io(_) | FederationError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn not_supported(backend: &str, operation: &str) -> Self {
        FederationError::NotSupported {
            backend: backend.to_string(),
            operation: operation.to_string(),
        }
    }

    /// True for errors that come straight from a storage engine and have not
    /// been classified yet.
    pub fn is_raw_storage(&self) -> bool {
        matches!(
            self,
            FederationError::Sqlite(_) | FederationError::Io(_) | FederationError::Json(_)
        )
    }

    /// Contextual data attached to the boundary payload, when the variant has any.
    fn data(&self) -> Option<serde_json::Value> {
        match self {
            FederationError::BackendUnavailable { backend, .. }
            | FederationError::FederationPartialFailure { backend, .. } => {
                Some(serde_json::json!({ "backend": backend }))
            }
            FederationError::NotSupported { backend, operation } => Some(serde_json::json!({
                "backend": backend,
                "operation": operation
            })),
            FederationError::RetryExhausted { action, attempts } => Some(serde_json::json!({
                "action": action,
                "attempts": attempts
            })),
            _ => None,
        }
    }
}

/// Error body returned at the boundary: `{id, message, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub id: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<&FederationError> for ErrorPayload {
    fn from(err: &FederationError) -> Self {
        ErrorPayload {
            id: err.kind(),
            message: err.to_string(),
            data: err.data(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;
