//! Error types for the Watson transport.
//!
//! We use `thiserror` for structured error kinds that callers can match
//! on. Read loops collapse every failure into a disconnect; send paths
//! surface the error to the caller.

use thiserror::Error;

/// Central error type for transport operations
#[derive(Error, Debug)]
pub enum Error {
    // === Lifecycle misuse ===
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("server already started")]
    AlreadyStarted,

    // === Handshake ===
    #[error("authentication failed")]
    AuthFailed,

    #[error("registration failed")]
    RegistrationFailed,

    // === Wire ===
    /// Clean remote close, or the all-zero header sentinel.
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A streaming send's reader ended before the declared length. The
    /// connection is desynchronized and must be closed.
    #[error("stream truncated: copied {copied} of {expected} bytes")]
    StreamTruncated { copied: u64, expected: u64 },

    // === Routing ===
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// Deadline expiry or endpoint shutdown while awaiting a sync response.
    #[error("request cancelled")]
    Cancelled,

    // === I/O ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the transport error
pub type Result<T> = std::result::Result<T, Error>;

// Header JSON failures are protocol violations, not I/O failures.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::StreamTruncated {
            copied: 3,
            expected: 10,
        };
        assert!(err.to_string().contains("3 of 10"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn json_error_maps_to_invalid_message() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }
}
