//! Error types for webserial-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on the control channel or data socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (control plane only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed frame, unexpected response, version
    /// mismatch). Fatal to the current transport session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by the companion process (opcodes 128-132).
    /// Does not invalidate the transport.
    #[error("{message}")]
    RemoteDevice { code: u8, message: String },

    /// The origin has no grant for the requested port.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A correlated call expired before the remote party answered.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A correlated call completed with a failure value.
    #[error("{0}")]
    CallFailed(String),

    /// Invalid open options or port filter, raised before any I/O.
    #[error("{0}")]
    Validation(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
