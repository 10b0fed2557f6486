//! Error types shared across the Wayfinder crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared validation and hygiene utilities.
#[derive(Error, Debug)]
pub enum Error {
    /// Event ID validation failed - computed ID doesn't match claimed ID.
    #[error("invalid event ID: {0}")]
    InvalidEventId(String),

    /// Event signature is invalid.
    #[error("invalid event signature: {0}")]
    InvalidSignature(String),

    /// Event has an invalid field (wrong kind, bogus timestamp, ...).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nostr library error.
    #[error("nostr error: {0}")]
    Nostr(#[from] nostr::event::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "created_at",
            reason: "before genesis".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("created_at"));
        assert!(msg.contains("before genesis"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_invalid_signature_display() {
        let err = Error::InvalidSignature("verification failed".to_string());
        assert!(err.to_string().contains("invalid event signature"));
    }
}
