//! Session lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a mediator session.
///
/// `Connecting → Handshaking → Connected → Disconnected`; any non-terminal
/// state may also move straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// TCP accepted, TLS not yet negotiated.
    Connecting,
    /// TLS negotiated, application challenge outstanding.
    Handshaking,
    /// Challenge answered; the session is live.
    Connected,
    /// Terminal. The transport has been released.
    Disconnected,
}

impl SessionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Handshaking)
                | (SessionState::Handshaking, SessionState::Connected)
                | (SessionState::Connecting, SessionState::Disconnected)
                | (SessionState::Handshaking, SessionState::Disconnected)
                | (SessionState::Connected, SessionState::Disconnected)
        )
    }

    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Why a session ended. Attached to every disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Transport failure or an unclassified close.
    Unknown,
    /// No heartbeat or handshake answer in time.
    Timeout,
    /// Malformed, unknown or out-of-place packet.
    ProtocolError,
    /// Certificate or challenge rejected.
    AuthenticationFailed,
    /// Explicit request from either side (including shutdown).
    Requested,
}

impl DisconnectReason {
    /// Human-readable text sent in the `DISCONNECT` packet.
    pub fn message(self) -> &'static str {
        match self {
            DisconnectReason::Unknown => "Connection closed.",
            DisconnectReason::Timeout => "Heartbeat timed out.",
            DisconnectReason::ProtocolError => "Invalid packet.",
            DisconnectReason::AuthenticationFailed => "Failed authentication.",
            DisconnectReason::Requested => "Disconnect requested.",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Unknown => write!(f, "unknown"),
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::ProtocolError => write!(f, "protocol_error"),
            DisconnectReason::AuthenticationFailed => write!(f, "authentication_failed"),
            DisconnectReason::Requested => write!(f, "requested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(SessionState::Connecting.can_transition_to(SessionState::Handshaking));
        assert!(SessionState::Handshaking.can_transition_to(SessionState::Connected));
        assert!(SessionState::Connected.can_transition_to(SessionState::Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Connected));
        assert!(!SessionState::Connected.can_transition_to(SessionState::Handshaking));
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Disconnected));
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Connecting));
    }

    #[test]
    fn test_every_live_state_can_disconnect() {
        for state in [
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Connected,
        ] {
            assert!(state.can_transition_to(SessionState::Disconnected));
            assert!(!state.is_terminal());
        }
        assert!(SessionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DisconnectReason::ProtocolError.to_string(), "protocol_error");
        assert_eq!(DisconnectReason::Timeout.message(), "Heartbeat timed out.");
    }
}
