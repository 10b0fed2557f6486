//! Error types for the relay pool and discovery router.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pool and discovery paths.
#[derive(Error, Debug)]
pub enum Error {
    /// The WebSocket failed to open.
    #[error("connect error for {url}: {reason}")]
    Connect {
        /// Relay URL the connection was for.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// Operation attempted on a session that is closed or degraded.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// Deadline exceeded on a query, publish, or connect.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The pool is at its connection ceiling and no idle session could be
    /// evicted within the wait period.
    #[error("max connections exceeded ({current}/{max})")]
    MaxConnectionsExceeded {
        /// Sessions currently open or connecting.
        current: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// SQLite error from routing storage.
    #[error("database error: {0}")]
    Database(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame that doesn't parse as a known relay message.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Validation error (bad URL, bad document, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Channel send error (receiver dropped).
    #[error("channel send error: {0}")]
    ChannelSend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<wayfinder_core::Error> for Error {
    fn from(err: wayfinder_core::Error) -> Self {
        Error::Validation(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_connections_display() {
        let err = Error::MaxConnectionsExceeded { current: 10, max: 10 };
        let msg = err.to_string();
        assert!(msg.contains("10/10"));
        assert!(msg.contains("max connections"));
    }

    #[test]
    fn test_not_connected_display() {
        let err = Error::NotConnected("wss://relay.example.com".to_string());
        assert!(err.to_string().contains("wss://relay.example.com"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Database(_)));
    }
}
