//! Shared error types for the fabric.

use thiserror::Error;

/// Top-level error type for fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The manager is missing configuration required for the operation
    /// (TLS context, identity, parsable config file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dial, accept, or TLS handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A caller or peer violated the message protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A TLS configuration could not be built.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A framing-layer error occurred.
    #[error("Wire error: {0}")]
    Wire(#[from] vigil_wire::WireError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias for Result with [`FabricError`].
pub type FabricResult<T> = Result<T, FabricError>;
