use std::io;

use thiserror::Error;

/// A frame or envelope the relay could not make sense of.
///
/// Protocol errors never tear down a connection: the offending frame is
/// dropped and the session keeps reading.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("frame is not valid utf-8")]
    InvalidUtf8,

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    #[error("'{kind}' message is missing '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("login data must be 'name password'")]
    BadCredentials,
}

/// Failure to read the next frame off a connection.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Recoverable: the frame was skipped.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

/// Outcome of a delivery that did not reach its recipient.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("'{0}' is not online")]
    NotFound(String),

    #[error("outbound queue for '{0}' is full")]
    QueueFull(String),

    #[error("connection for '{0}' is closed")]
    Disconnected(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("account store i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("account store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("password hashing failed: {0}")]
    Hash(String),
}
