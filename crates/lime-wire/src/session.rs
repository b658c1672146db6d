//! Session: one agent connection and its state machine.
//!
//! A [`Session`] is created when a TCP connection is accepted and lives until
//! it reaches [`SessionState::Disconnected`]. It owns the write half of the
//! TLS stream, the outbound task queue, and the bookkeeping used by the
//! heartbeat monitor. The read half stays with the gateway's read loop, which
//! is the only reader of a session.

use crate::error::{WireError, WireResult};
use crate::packet::{write_packet, Packet};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lime_types::agent::{AgentId, AgentIdentity};
use lime_types::session::{DisconnectReason, SessionState};
use lime_types::task::Task;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Notify};
use tracing::debug;
use uuid::Uuid;

/// Boxed write half of a session transport.
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a best-effort `DISCONNECT` or transport shutdown may take.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of a session, as listed to dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Unique per connection, never reused.
    pub session_id: Uuid,
    /// Agent resolved from the peer address.
    pub agent_id: AgentId,
    /// Display name from the agent directory.
    pub agent_name: String,
    /// Peer socket address.
    pub remote_addr: SocketAddr,
    /// State at snapshot time.
    pub state: SessionState,
    /// Last handshake or matching heartbeat echo.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Tasks queued but not yet written.
    pub pending_tasks: usize,
}

struct PendingProbe {
    nonce: Bytes,
    reply: oneshot::Sender<Bytes>,
}

/// One agent connection.
pub struct Session {
    id: Uuid,
    remote_addr: SocketAddr,
    identity: AgentIdentity,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    reason: Mutex<Option<DisconnectReason>>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    queue: Mutex<VecDeque<Task>>,
    queue_ready: Notify,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    probe: Mutex<Option<PendingProbe>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// A new session in `Connecting`, for an agent already identified by address.
    pub fn new(remote_addr: SocketAddr, identity: AgentIdentity) -> Self {
        let now = Utc::now();
        let (closed, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            identity,
            created_at: now,
            state: Mutex::new(SessionState::Connecting),
            reason: Mutex::new(None),
            last_heartbeat: Mutex::new(now),
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Notify::new(),
            writer: tokio::sync::Mutex::new(None),
            probe: Mutex::new(None),
            closed,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer socket address as accepted.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Directory entry this connection was matched to.
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Shorthand for `identity().id`.
    pub fn agent_id(&self) -> AgentId {
        self.identity.id
    }

    /// When the connection was accepted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Why the session ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a non-terminal transition. Disconnects go through
    /// [`crate::registry::SessionRegistry::retire`].
    pub(crate) fn transition(&self, next: SessionState) -> WireResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if next.is_terminal() || !state.can_transition_to(next) {
            return Err(WireError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        debug!(session = %self.id, from = %*state, to = %next, "Session transition");
        *state = next;
        Ok(())
    }

    /// Move to `Disconnected` if not already there. Returns `true` for the
    /// single caller that performed the transition.
    pub(crate) fn mark_disconnected(&self, reason: DisconnectReason) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return false;
        }
        *state = SessionState::Disconnected;
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        true
    }

    /// TLS is up: attach the write half and move to `Handshaking`.
    pub fn begin_handshake(&self, writer: SessionWriter) -> WireResult<()> {
        self.transition(SessionState::Handshaking)?;
        // Uncontended: nothing writes before the handshake starts.
        if let Ok(mut slot) = self.writer.try_lock() {
            *slot = Some(writer);
            Ok(())
        } else {
            Err(WireError::SessionClosed)
        }
    }

    /// Last time the agent proved liveness.
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn touch_heartbeat(&self) {
        self.set_last_heartbeat(Utc::now());
    }

    pub(crate) fn set_last_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Write one packet. Fails once the session has been disconnected, and
    /// aborts an in-flight write when the session is closed underneath it.
    pub async fn send(&self, packet: &Packet) -> WireResult<()> {
        let mut closed = self.closed.subscribe();
        if self.state().is_terminal() || *closed.borrow() {
            return Err(WireError::SessionClosed);
        }
        tokio::select! {
            res = self.write_unchecked(packet) => res,
            _ = closed.wait_for(|c| *c) => Err(WireError::SessionClosed),
        }
    }

    async fn write_unchecked(&self, packet: &Packet) -> WireResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(WireError::SessionClosed)?;
        write_packet(writer, packet).await
    }

    /// Append a task to the FIFO queue.
    pub fn enqueue(&self, task: Task) -> WireResult<()> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() != SessionState::Connected {
            return Err(WireError::NotConnected(self.identity.id.to_string()));
        }
        queue.push_back(task);
        drop(queue);
        self.queue_ready.notify_one();
        Ok(())
    }

    /// Number of tasks waiting to be written.
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for the next queued task. `None` once the session is closed.
    pub(crate) async fn next_task(&self) -> Option<Task> {
        let mut closed = self.closed.subscribe();
        loop {
            if self.state().is_terminal() {
                return None;
            }
            if let Some(task) = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return Some(task);
            }
            tokio::select! {
                _ = self.queue_ready.notified() => {}
                _ = closed.wait_for(|c| *c) => return None,
            }
        }
    }

    /// Drop everything still queued, returning how many tasks were lost.
    pub(crate) fn discard_queue(&self) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let n = queue.len();
        queue.clear();
        n
    }

    /// Register an outstanding heartbeat probe. The receiver resolves with
    /// whatever payload the agent echoes.
    pub(crate) fn begin_probe(&self, nonce: Bytes) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(PendingProbe {
            nonce,
            reply: tx,
        });
        rx
    }

    /// Hand an inbound `HEARTBEAT` payload to the outstanding probe, if any.
    pub(crate) fn complete_probe(&self, payload: Bytes) -> bool {
        let pending = self.probe.lock().unwrap_or_else(|e| e.into_inner()).take();
        match pending {
            Some(p) => {
                debug!(
                    session = %self.id,
                    expected = p.nonce.len(),
                    got = payload.len(),
                    "Heartbeat echo received"
                );
                p.reply.send(payload).is_ok()
            }
            None => false,
        }
    }

    pub(crate) fn cancel_probe(&self) {
        self.probe.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Resolves once the session has been disconnected and its transport released.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Tear down after [`Session::mark_disconnected`]: best-effort `DISCONNECT`,
    /// wake every waiter, then shut the transport. Runs once per session.
    pub(crate) async fn release(&self, reason: DisconnectReason) -> usize {
        let discarded = self.discard_queue();
        self.cancel_probe();

        let goodbye = Packet::Disconnect(reason.message().to_string());
        match tokio::time::timeout(RELEASE_TIMEOUT, self.write_unchecked(&goodbye)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = %self.id, error = %e, "DISCONNECT not delivered"),
            Err(_) => debug!(session = %self.id, "DISCONNECT timed out"),
        }

        self.closed.send_replace(true);
        self.queue_ready.notify_waiters();

        if let Ok(mut guard) = tokio::time::timeout(RELEASE_TIMEOUT, self.writer.lock()).await {
            if let Some(mut writer) = guard.take() {
                let _ = tokio::time::timeout(RELEASE_TIMEOUT, writer.shutdown()).await;
            }
        }
        discarded
    }

    /// Listing snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            agent_id: self.identity.id,
            agent_name: self.identity.name.clone(),
            remote_addr: self.remote_addr,
            state: self.state(),
            last_heartbeat_at: self.last_heartbeat(),
            pending_tasks: self.pending_tasks(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent", &self.identity.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::read_packet;
    use lime_types::agent::Thumbprint;
    use lime_types::task::TaskKind;
    use tokio::io::DuplexStream;

    pub(crate) fn test_identity(name: &str) -> AgentIdentity {
        AgentIdentity {
            id: AgentId::new(),
            name: name.to_string(),
            thumbprint: Thumbprint::parse("AA").unwrap(),
        }
    }

    /// A session in `Handshaking` whose peer end is returned for reading.
    pub(crate) fn handshaking_session(name: &str) -> (Session, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let session = Session::new("127.0.0.1:40000".parse().unwrap(), test_identity(name));
        session.begin_handshake(Box::new(local)).unwrap();
        (session, remote)
    }

    pub(crate) fn connected_session(name: &str) -> (Session, DuplexStream) {
        let (session, remote) = handshaking_session(name);
        session.transition(SessionState::Connected).unwrap();
        (session, remote)
    }

    #[test]
    fn test_new_session_is_connecting() {
        let session = Session::new("10.0.0.1:5000".parse().unwrap(), test_identity("a"));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.disconnect_reason().is_none());
        assert_eq!(session.pending_tasks(), 0);
    }

    #[test]
    fn test_cannot_skip_handshake() {
        let session = Session::new("10.0.0.1:5000".parse().unwrap(), test_identity("a"));
        let err = session.transition(SessionState::Connected).unwrap_err();
        assert!(matches!(err, WireError::InvalidTransition { .. }));
    }

    #[test]
    fn test_mark_disconnected_once() {
        let (session, _peer) = connected_session("a");
        assert!(session.mark_disconnected(DisconnectReason::Timeout));
        assert!(!session.mark_disconnected(DisconnectReason::ProtocolError));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::Timeout));
    }

    #[test]
    fn test_enqueue_requires_connected() {
        let (session, _peer) = handshaking_session("a");
        let err = session
            .enqueue(Task::once(TaskKind::CollectStatistics))
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_next_task_fifo() {
        let (session, _peer) = connected_session("a");
        session.enqueue(Task::once(TaskKind::Execute).with_args("a")).unwrap();
        session.enqueue(Task::once(TaskKind::Execute).with_args("b")).unwrap();
        assert_eq!(session.pending_tasks(), 2);
        assert_eq!(session.next_task().await.unwrap().args.as_deref(), Some("a"));
        assert_eq!(session.next_task().await.unwrap().args.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_release_sends_disconnect_and_discards_queue() {
        let (session, mut peer) = connected_session("a");
        session.enqueue(Task::once(TaskKind::Execute)).unwrap();
        assert!(session.mark_disconnected(DisconnectReason::Requested));
        let discarded = session.release(DisconnectReason::Requested).await;
        assert_eq!(discarded, 1);

        let packet = read_packet(&mut peer, 1024).await.unwrap();
        assert_eq!(
            packet,
            Packet::Disconnect(DisconnectReason::Requested.message().to_string())
        );
        assert!(session.next_task().await.is_none());
        assert!(session.send(&Packet::Heartbeat(Bytes::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_completion() {
        let (session, _peer) = connected_session("a");
        let rx = session.begin_probe(Bytes::from_static(b"nonce"));
        assert!(session.complete_probe(Bytes::from_static(b"nonce")));
        assert_eq!(&rx.await.unwrap()[..], b"nonce");
        assert!(!session.complete_probe(Bytes::from_static(b"late")));
    }

    #[test]
    fn test_info_snapshot() {
        let (session, _peer) = connected_session("build-01");
        let info = session.info();
        assert_eq!(info.agent_name, "build-01");
        assert_eq!(info.state, SessionState::Connected);
        assert_eq!(info.session_id, session.id());
    }
}
