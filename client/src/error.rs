//! Error types for the Copilot client

use crate::dialect::Dialect;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when communicating with the Copilot CLI server
#[derive(Error, Debug)]
pub enum Error {
    /// Contradictory or malformed options, raised at construction before any
    /// connection attempt.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("operation '{operation}' is not supported under the {dialect} dialect")]
    UnsupportedOperation { dialect: Dialect, operation: String },

    #[error("failed to spawn Copilot CLI server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("client not connected. Call start() first")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server violated the wire contract (unparseable notification, idle turn
    /// with no assistant output, version mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A `session.error` event arrived inside a turn; carries the
    /// server-reported message.
    #[error("session error: {0}")]
    Session(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the error rejects a single pending call because the
    /// underlying connection went away.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}
