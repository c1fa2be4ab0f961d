//! Error types for the engine

use thiserror::Error;

use super::types::Revision;

/// Result type alias using our EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine and collaborator operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// A collaborator (market data, sentiment, exchange, store) is unavailable
    #[error("Transient dependency error ({dependency}): {message}")]
    TransientDependency {
        dependency: &'static str,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// HTTP request errors
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Rate limiting errors
    #[error("Rate limit exceeded: {message}, retry after {retry_after_seconds:?} seconds")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Malformed collaborator output or out-of-range derived values
    #[error("Validation error: {0}")]
    Validation(String),

    /// Version-checked write lost the race
    #[error("Version conflict: expected revision {expected}, store has {actual}")]
    VersionConflict { expected: Revision, actual: Revision },

    /// Unrecoverable state problem; halts the affected pair
    #[error("Fatal state error: {0}")]
    FatalState(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Invalid API response
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Shorthand for a transient dependency failure
    pub fn transient(dependency: &'static str, message: impl Into<String>) -> Self {
        EngineError::TransientDependency {
            dependency,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::TransientDependency { .. }
            | EngineError::Timeout(_)
            | EngineError::RateLimit { .. } => true,
            EngineError::HttpRequest(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(true)
            }
            _ => false,
        }
    }

    /// Whether this error must halt the pair's worker
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::FatalState(_) | EngineError::VersionConflict { .. }
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::transient("market_data", "down").is_retryable());
        assert!(EngineError::Timeout("submit".into()).is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
        assert!(!EngineError::FatalState("corrupt".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        let conflict = EngineError::VersionConflict {
            expected: Revision::new("1"),
            actual: Revision::new("2"),
        };
        assert!(conflict.is_fatal());
        assert!(!EngineError::transient("store", "503").is_fatal());
    }
}
