//! Error types for Toolgate operations

/// Result type for Toolgate operations
pub type Result<T> = std::result::Result<T, ToolgateError>;

/// Error types for the tool-integration layer
#[derive(Debug, thiserror::Error)]
pub enum ToolgateError {
    /// Handshake or transport failure; a fresh connect may succeed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unknown server, tool or function
    #[error("{0}")]
    NotFound(String),

    /// Operation denied by the security policy
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Nobody answered the consent prompt in time
    #[error("Operation not authorized")]
    ConsentTimeout,

    /// The pending consent request was cancelled
    #[error("Consent request cancelled: {0}")]
    ConsentCancelled(String),

    /// The server answered with a JSON-RPC error object
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// A request exceeded its deadline on the transport
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ToolgateError {
    /// Whether the orchestrator may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolgateError::Connection(_) | ToolgateError::Timeout(_))
    }
}

impl From<String> for ToolgateError {
    fn from(s: String) -> Self {
        ToolgateError::Other(s)
    }
}

impl From<&str> for ToolgateError {
    fn from(s: &str) -> Self {
        ToolgateError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ToolgateError {
    fn from(err: anyhow::Error) -> Self {
        ToolgateError::Other(err.to_string())
    }
}
