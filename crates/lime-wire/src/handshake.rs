//! Application-level handshake run right after TLS.
//!
//! The mediator sends a fresh random token in `HANDSHAKE_CHALLENGE`; the agent
//! must echo it byte-for-byte in `HANDSHAKE_RESPONSE` before the timeout.

use crate::error::{WireError, WireResult};
use crate::packet::{read_packet, write_packet, Opcode, Packet};
use crate::session::Session;
use bytes::Bytes;
use rand::RngCore;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

/// Challenge token length in bytes.
pub const TOKEN_LEN: usize = 32;

/// A fresh token from the OS CSPRNG.
pub fn generate_token() -> Zeroizing<Vec<u8>> {
    let mut token = Zeroizing::new(vec![0u8; TOKEN_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut token);
    token
}

/// Constant-time comparison of a token and its echo.
pub fn tokens_match(expected: &[u8], echoed: &[u8]) -> bool {
    expected.len() == echoed.len() && bool::from(expected.ct_eq(echoed))
}

/// Mediator side: challenge the peer and verify its echo.
///
/// The whole exchange is bounded by `timeout`. A wrong opcode fails with
/// [`WireError::UnexpectedPacket`], a wrong token with
/// [`WireError::HandshakeMismatch`].
pub async fn challenge<R>(
    session: &Session,
    reader: &mut R,
    max_payload: u32,
    timeout: Duration,
) -> WireResult<()>
where
    R: AsyncRead + Unpin,
{
    let exchange = async {
        let token = generate_token();
        session
            .send(&Packet::HandshakeChallenge(Bytes::copy_from_slice(&token)))
            .await?;
        debug!(session = %session.id(), "Handshake challenge sent");

        match read_packet(reader, max_payload).await? {
            Packet::HandshakeResponse(echo) if tokens_match(&token, &echo) => Ok(()),
            Packet::HandshakeResponse(_) => Err(WireError::HandshakeMismatch),
            other => Err(WireError::UnexpectedPacket {
                expected: Opcode::HandshakeResponse,
                got: other.opcode(),
            }),
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| {
            WireError::Timeout(format!(
                "no handshake response within {}s",
                timeout.as_secs()
            ))
        })?
}

/// Agent side: wait for the challenge and echo it back.
pub async fn respond<R, W>(
    reader: &mut R,
    writer: &mut W,
    max_payload: u32,
    timeout: Duration,
) -> WireResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        match read_packet(reader, max_payload).await? {
            Packet::HandshakeChallenge(token) => {
                write_packet(writer, &Packet::HandshakeResponse(token)).await
            }
            other => Err(WireError::UnexpectedPacket {
                expected: Opcode::HandshakeChallenge,
                got: other.opcode(),
            }),
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WireError::Timeout("no handshake challenge received".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::handshaking_session;
    use lime_types::session::DisconnectReason;

    const MAX: u32 = 1024;

    #[test]
    fn test_tokens_are_fresh() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match(b"abc", b"abc"));
        assert!(!tokens_match(b"abc", b"abd"));
        assert!(!tokens_match(b"abc", b"ab"));
        assert!(!tokens_match(b"abc", b""));
    }

    #[tokio::test]
    async fn test_echo_succeeds() {
        let (session, peer) = handshaking_session("a");
        let (mut from_agent_rx, mut from_agent_tx) = tokio::io::duplex(1024);
        let (mut peer_rx, _peer_tx) = tokio::io::split(peer);

        let agent = tokio::spawn(async move {
            respond(&mut peer_rx, &mut from_agent_tx, MAX, Duration::from_secs(5)).await
        });
        challenge(&session, &mut from_agent_rx, MAX, Duration::from_secs(5))
            .await
            .unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_token_is_mismatch() {
        let (session, mut peer) = handshaking_session("a");
        let (mut from_agent_rx, mut from_agent_tx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = read_packet(&mut peer, MAX).await;
            let forged = Packet::HandshakeResponse(Bytes::from_static(&[0u8; TOKEN_LEN]));
            write_packet(&mut from_agent_tx, &forged).await.unwrap();
            peer
        });
        let err = challenge(&session, &mut from_agent_rx, MAX, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::HandshakeMismatch));
        assert_eq!(err.disconnect_reason(), DisconnectReason::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_wrong_opcode_is_protocol_error() {
        let (session, mut peer) = handshaking_session("a");
        let (mut from_agent_rx, mut from_agent_tx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = read_packet(&mut peer, MAX).await;
            write_packet(&mut from_agent_tx, &Packet::Heartbeat(Bytes::new()))
                .await
                .unwrap();
            peer
        });
        let err = challenge(&session, &mut from_agent_rx, MAX, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.disconnect_reason(), DisconnectReason::ProtocolError);
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let (session, _peer) = handshaking_session("a");
        let (mut from_agent_rx, _from_agent_tx) = tokio::io::duplex(1024);
        let err = challenge(&session, &mut from_agent_rx, MAX, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
        assert_eq!(err.disconnect_reason(), DisconnectReason::Timeout);
    }
}
