//! Error types for the tiered response cache.
//!
//! Most of these never reach a caller of the router: the store converts
//! backend failures into misses, the tiered cache counts them, and the router
//! turns compute failures into a fallback reply. They still exist as typed
//! values so every soft-failure path logs the same taxonomy.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The remote key-value backend could not be reached or returned an error.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A backend call exceeded its bounded timeout.
    #[error("Backend call timed out after {0}ms")]
    Timeout(u64),

    /// The circuit breaker is open and the call was short-circuited.
    #[error("Circuit open for backend '{0}'")]
    CircuitOpen(String),

    /// A value could not be serialized or deserialized.
    #[error("Serialization error ({context}): {message}")]
    Serialization { context: String, message: String },

    /// A write was refused because it violates the data-class policy.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// The caller-supplied compute callback failed.
    #[error("Compute failure: {0}")]
    ComputeFailure(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// Build a [`CacheError::Serialization`] tagged with where it happened.
    pub fn serialization(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error should count against a backend's circuit breaker.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::ComputeFailure(format!("{:#}", err))
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}
