//! Error types for view coordination

use thiserror::Error;

/// Result type alias using the coordination Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for view coordination
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors
    #[error("No node owns shard {shard}")]
    ShardUnavailable { shard: u32 },

    #[error("Node unreachable: {node_id}")]
    NodeUnreachable { node_id: String },

    #[error("Coordinator unavailable for project {project}")]
    CoordinatorUnavailable { project: String },

    // Backend errors
    #[error("Backend {backend} failed: {message}")]
    Backend { backend: String, message: String },

    // Directory errors
    #[error("Invalid project reference: {value}")]
    InvalidProjectRef { value: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ShardUnavailable { .. }
                | Error::NodeUnreachable { .. }
                | Error::CoordinatorUnavailable { .. }
                | Error::Backend { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidConfig { .. })
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::ShardUnavailable { .. } => Some(1000),
            Error::NodeUnreachable { .. } => Some(2000),
            Error::CoordinatorUnavailable { .. } => Some(500),
            Error::Backend { .. } => Some(100),
            _ => None,
        }
    }

    /// Shorthand for a backend failure
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
