//! Shared error types for the LIME system.

use thiserror::Error;

/// Top-level error type for LIME components outside the wire layer.
#[derive(Error, Debug)]
pub enum LimeError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A certificate or key could not be loaded or was rejected.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The requested agent is not registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Invalid user input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with LimeError.
pub type LimeResult<T> = Result<T, LimeError>;
