//! Error types for the Stratum protocol client.

use thiserror::Error;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on an outgoing frame
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unparsable frame received from the pool. The frame is dropped; the
    /// connection survives.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// TCP connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS handshake failed. Fatal for the endpoint: certificates bind to
    /// the host name, so other resolved addresses would fail identically.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// Timeout waiting for a network operation
    #[error("Timed out")]
    Timeout,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
