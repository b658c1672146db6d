//! Errors from the wire protocol layer.

use crate::packet::Opcode;
use lime_types::session::{DisconnectReason, SessionState};
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Stream ended mid-frame: expected {expected} bytes, received {received}")]
    TruncatedStream { expected: usize, received: usize },
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u32),
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },
    #[error("Malformed {opcode} payload: {reason}")]
    MalformedPayload { opcode: Opcode, reason: String },
    #[error("Unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: Opcode, got: Opcode },
    #[error("Handshake response does not match the challenge")]
    HandshakeMismatch,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("Agent not connected: {0}")]
    NotConnected(String),
    #[error("Session closed")]
    SessionClosed,
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl WireError {
    /// The reason attached to a session disconnect caused by this error.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            WireError::TruncatedStream { .. }
            | WireError::UnknownOpcode(_)
            | WireError::PayloadTooLarge { .. }
            | WireError::MalformedPayload { .. }
            | WireError::UnexpectedPacket { .. }
            | WireError::InvalidTransition { .. } => DisconnectReason::ProtocolError,
            WireError::HandshakeMismatch | WireError::Tls(_) | WireError::Certificate(_) => {
                DisconnectReason::AuthenticationFailed
            }
            WireError::Timeout(_) => DisconnectReason::Timeout,
            WireError::Io(_)
            | WireError::ConnectionClosed
            | WireError::NotConnected(_)
            | WireError::SessionClosed => DisconnectReason::Unknown,
        }
    }
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_protocol_error() {
        assert_eq!(
            WireError::UnknownOpcode(99).disconnect_reason(),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            WireError::PayloadTooLarge { size: 10, max: 1 }.disconnect_reason(),
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            WireError::UnexpectedPacket {
                expected: Opcode::HandshakeResponse,
                got: Opcode::Heartbeat,
            }
            .disconnect_reason(),
            DisconnectReason::ProtocolError
        );
    }

    #[test]
    fn test_auth_and_timeout_mapping() {
        assert_eq!(
            WireError::HandshakeMismatch.disconnect_reason(),
            DisconnectReason::AuthenticationFailed
        );
        assert_eq!(
            WireError::Timeout("handshake".into()).disconnect_reason(),
            DisconnectReason::Timeout
        );
        assert_eq!(
            WireError::ConnectionClosed.disconnect_reason(),
            DisconnectReason::Unknown
        );
    }

    #[test]
    fn test_display() {
        let err = WireError::TruncatedStream {
            expected: 8,
            received: 3,
        };
        assert!(err.to_string().contains("expected 8 bytes"));
    }
}
