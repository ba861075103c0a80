use thiserror::Error;

/// Result type for scenesync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while relaying sessions or replicating the scene
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed envelope, unknown command or undecodable sync payload
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A sync message was generated or received for a peer without a cursor
    #[error("No sync cursor registered for peer: {peer}")]
    Convergence { peer: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// A scene row references something that cannot be resolved
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "persistence")]
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        SyncError::Integrity {
            message: message.into(),
        }
    }
}
