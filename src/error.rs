//! WolfKV Error Types

use thiserror::Error;

use crate::cluster::PeerIdentity;

/// Result type alias for WolfKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid staged key: {0}")]
    InvalidStagedKey(String),

    // Replication errors
    /// A target peer never became reachable within `fail_after` polls
    #[error("Connection failed to {peer}")]
    ConnectionFailed { peer: PeerIdentity, attempts: u32 },

    #[error("Connection to {0} lost")]
    Disconnected(PeerIdentity),

    /// A peer's handler reported failure
    #[error("Remote error from {peer}: {message}")]
    Remote { peer: PeerIdentity, message: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Usage errors
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::Disconnected(_) | Error::Network(_)
        )
    }

    /// Check if this error came from a peer being unreachable
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionFailed { .. } | Error::Disconnected(_))
    }
}
