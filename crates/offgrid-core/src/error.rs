//! Error types for Offgrid

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Offgrid operations
pub type OffgridResult<T> = Result<T, OffgridError>;

/// Main error type for Offgrid
#[derive(Error, Debug)]
pub enum OffgridError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Network timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OffgridError {
    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new cache store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new invalid-request error
    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    /// Create a new lifecycle error
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failure is transient and worth another attempt later.
    ///
    /// A failed mutation is queued for replay only for errors in this class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OffgridError::Network(_) | OffgridError::Timeout(_))
    }

    /// Short category label used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            OffgridError::Network(_) => "network",
            OffgridError::Timeout(_) => "timeout",
            OffgridError::Store(_) => "store",
            OffgridError::Request(_) => "request",
            OffgridError::Lifecycle(_) => "lifecycle",
            OffgridError::Config(_) => "config",
            OffgridError::Io(_) => "io",
            OffgridError::Url(_) => "url",
            OffgridError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OffgridError::network("down").category(), "network");
        assert_eq!(OffgridError::store("locked").category(), "store");
        assert_eq!(
            OffgridError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(OffgridError::network("down").is_retryable());
        assert!(OffgridError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OffgridError::store("locked").is_retryable());
        assert!(!OffgridError::config("bad").is_retryable());
        assert!(!OffgridError::request("no host").is_retryable());
    }
}
