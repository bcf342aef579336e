use thiserror::Error;

/// Errors that can occur in the fleet controller library
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container runtime unreachable or rejected a call
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The configured overlay network is absent from a container
    #[error("Overlay network missing: {0}")]
    NetworkMissing(String),

    /// Metrics backend query failed (transport or payload)
    #[error("Metric fetch failed: {0}")]
    MetricFetchFailed(String),

    /// Selection produced no routable worker
    #[error("No healthy workers available")]
    NoHealthyWorker,

    /// Upstream forward failed after exhausting retries
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// Client request body exceeds the configured limit
    #[error("Request body too large")]
    RequestTooLarge,

    /// Unknown selection policy identifier
    #[error("Invalid selection policy: {0}")]
    InvalidPolicy(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Internal(String),
}

/// Result type alias using ControllerError
pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<String> for ControllerError {
    fn from(s: String) -> Self {
        ControllerError::Internal(s)
    }
}

impl From<&str> for ControllerError {
    fn from(s: &str) -> Self {
        ControllerError::Internal(s.to_string())
    }
}

impl From<bollard::errors::Error> for ControllerError {
    fn from(err: bollard::errors::Error) -> Self {
        ControllerError::RuntimeUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for ControllerError {
    fn from(err: config::ConfigError) -> Self {
        ControllerError::Config(err.to_string())
    }
}
