//! Error types for the hybrid memory system
//!
//! Every failure that crosses the [`MemoryManager`](crate::MemoryManager)
//! boundary is a [`MemoryError`]. Adapters report their own [`AdapterError`]
//! which is wrapped with the adapter label before it reaches a caller.

use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Result alias for backend adapter calls
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Errors surfaced by the memory system
#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    /// Id or version absent, or the id was tombstoned
    #[error("memory item not found: {id}{}", version_suffix(.version))]
    NotFound { id: String, version: Option<u64> },

    /// Adapter I/O failure or timeout
    #[error("backend '{adapter}' unavailable: {reason}")]
    BackendUnavailable { adapter: String, reason: String },

    /// Divergent updates detected during synchronization
    #[error("conflicting updates for '{id}' between '{source_adapter}' and '{target_adapter}'")]
    Conflict {
        id: String,
        source_adapter: String,
        target_adapter: String,
    },

    /// A transaction participant failed; every change was rolled back
    #[error("transaction {transaction_id} aborted: {reason}")]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    /// Malformed query predicate
    #[error("query syntax error at {position}: {message}")]
    QuerySyntax { position: usize, message: String },

    /// A cache loader failed; shared by every single-flight waiter
    #[error("cache load failed for '{key}': {source}")]
    CacheLoad {
        key: String,
        #[source]
        source: Arc<MemoryError>,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input value
    #[error("validation failed for {field}: {constraint} (got {value})")]
    Validation {
        field: String,
        constraint: String,
        value: String,
    },

    /// Payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MemoryError {
    /// Item absent at its latest version
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            version: None,
        }
    }

    /// Specific version absent
    pub fn version_not_found(id: impl Into<String>, version: u64) -> Self {
        Self::NotFound {
            id: id.into(),
            version: Some(version),
        }
    }

    /// Backend failure
    pub fn backend(adapter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            adapter: adapter.into(),
            reason: reason.into(),
        }
    }

    /// Transaction abort
    pub fn aborted(transaction_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
            reason: reason.into(),
        }
    }

    /// Query parse failure
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::QuerySyntax {
            position,
            message: message.into(),
        }
    }

    /// Validation failure
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
        }
    }

    /// Configuration failure
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap an adapter-native error with the adapter label
    pub fn from_adapter(adapter: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound { id, version } => Self::NotFound { id, version },
            AdapterError::Io(reason) => Self::backend(adapter, reason),
            AdapterError::Unsupported(op) => {
                Self::backend(adapter, format!("operation not supported: {op}"))
            }
            AdapterError::Staging(reason) => {
                Self::backend(adapter, format!("staging failed: {reason}"))
            }
            AdapterError::Invalid(reason) => Self::validation("item", reason, adapter),
        }
    }

    /// Whether the caller should treat this as an absent item
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::CacheLoad { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } => true,
            Self::CacheLoad { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

fn version_suffix(version: &Option<u64>) -> String {
    version.map(|v| format!(" (version {v})")).unwrap_or_default()
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised inside a backend adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("not found: {id}")]
    NotFound { id: String, version: Option<u64> },

    #[error("io failure: {0}")]
    Io(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("staging failure: {0}")]
    Staging(String),

    #[error("invalid item: {0}")]
    Invalid(String),
}

impl AdapterError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            id: id.into(),
            version: None,
        }
    }

    pub fn version_not_found(id: impl Into<String>, version: u64) -> Self {
        Self::NotFound {
            id: id.into(),
            version: Some(version),
        }
    }

    /// The store itself failed, as opposed to rejecting the request
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Staging(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_errors_are_wrapped() {
        let err = MemoryError::from_adapter("vector", AdapterError::Io("disk full".into()));
        assert!(matches!(
            err,
            MemoryError::BackendUnavailable { ref adapter, .. } if adapter == "vector"
        ));
        assert!(err.is_retryable());

        let err = MemoryError::from_adapter("kv", AdapterError::version_not_found("a", 3));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "memory item not found: a (version 3)");
    }

    #[test]
    fn test_backend_failures_are_distinguished_from_rejections() {
        assert!(AdapterError::Io("closed".into()).is_backend_failure());
        assert!(AdapterError::Staging("full".into()).is_backend_failure());
        assert!(!AdapterError::Invalid("empty id".into()).is_backend_failure());
        assert!(!AdapterError::not_found("a").is_backend_failure());
    }

    #[test]
    fn test_cache_load_delegates_classification() {
        let inner = Arc::new(MemoryError::not_found("x"));
        let err = MemoryError::CacheLoad {
            key: "x".into(),
            source: inner,
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }
}
