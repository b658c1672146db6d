//! Task dispatcher: serializes queued work onto each session's transport.
//!
//! Each connected session gets one dispatcher task. It takes one task at a
//! time from the session's FIFO queue and writes it as a `TASK` or `JOB`
//! packet, so tasks reach the wire in enqueue order. A write failure
//! disconnects the session with [`DisconnectReason::ProtocolError`]; whatever
//! is still queued is discarded, never moved to another session.

use crate::error::{WireError, WireResult};
use crate::packet::Packet;
use crate::registry::SessionRegistry;
use crate::session::Session;
use lime_types::agent::AgentId;
use lime_types::session::DisconnectReason;
use lime_types::task::Task;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes tasks to agents' sessions and runs the per-session writers.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    registry: SessionRegistry,
    dispatched: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl TaskDispatcher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            dispatched: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a task for a connected agent.
    pub fn enqueue(&self, agent_id: AgentId, task: Task) -> WireResult<()> {
        let session = self
            .registry
            .find_by_agent(agent_id)
            .ok_or_else(|| WireError::NotConnected(agent_id.to_string()))?;
        debug!(
            session = %session.id(),
            agent = %agent_id,
            kind = %task.kind,
            "Task queued"
        );
        session.enqueue(task)
    }

    /// Total tasks written to the wire since start.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Tasks taken off a queue whose write was cut short by a disconnect.
    /// Tasks still queued at disconnect are counted by the registry instead.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the writer task for a session. It exits when the session closes.
    pub fn spawn(&self, session: Arc<Session>) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(&session).await })
    }

    async fn run(&self, session: &Session) {
        while let Some(task) = session.next_task().await {
            let kind = task.kind;
            let packet = Packet::Task(task);
            match session.send(&packet).await {
                Ok(()) => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        session = %session.id(),
                        opcode = %packet.opcode(),
                        kind = %kind,
                        "Task dispatched"
                    );
                }
                Err(WireError::SessionClosed) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %session.id(),
                        agent = %session.agent_id(),
                        kind = %kind,
                        "Task discarded, session closed during write"
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        session = %session.id(),
                        agent = %session.agent_id(),
                        error = %e,
                        "Task dispatch failed, disconnecting"
                    );
                    self.registry
                        .retire(session, DisconnectReason::ProtocolError)
                        .await;
                    break;
                }
            }
        }
        debug!(session = %session.id(), "Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{read_packet, Opcode};
    use crate::session::tests::handshaking_session;
    use lime_types::session::SessionState;
    use lime_types::task::TaskKind;
    use std::time::Duration;

    async fn connected(registry: &SessionRegistry) -> (Arc<Session>, tokio::io::DuplexStream) {
        let (session, peer) = handshaking_session("worker");
        let session = Arc::new(session);
        registry.promote(&session).await.unwrap();
        (session, peer)
    }

    #[tokio::test]
    async fn test_tasks_reach_wire_in_order() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry.clone());
        let (session, mut peer) = connected(&registry).await;

        for arg in ["A", "B", "C"] {
            dispatcher
                .enqueue(session.agent_id(), Task::once(TaskKind::Execute).with_args(arg))
                .unwrap();
        }
        let _writer = dispatcher.spawn(Arc::clone(&session));

        for expected in ["A", "B", "C"] {
            match read_packet(&mut peer, 1024).await.unwrap() {
                Packet::Task(task) => assert_eq!(task.args.as_deref(), Some(expected)),
                other => panic!("expected task, got {other:?}"),
            }
        }
        assert_eq!(session.pending_tasks(), 0);
        assert_eq!(dispatcher.dispatched(), 3);
    }

    #[tokio::test]
    async fn test_recurring_job_uses_job_opcode() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry.clone());
        let (session, mut peer) = connected(&registry).await;
        let _writer = dispatcher.spawn(Arc::clone(&session));

        dispatcher
            .enqueue(session.agent_id(), Task::recurring(TaskKind::CollectStatistics))
            .unwrap();
        let packet = read_packet(&mut peer, 1024).await.unwrap();
        assert_eq!(packet.opcode(), Opcode::Job);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_agent_not_connected() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry);
        let err = dispatcher
            .enqueue(AgentId::new(), Task::once(TaskKind::CollectStatistics))
            .unwrap_err();
        assert!(matches!(err, WireError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_write_failure_disconnects_with_protocol_error() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry.clone());
        let (session, peer) = connected(&registry).await;
        drop(peer);

        session.enqueue(Task::once(TaskKind::Execute)).unwrap();
        session.enqueue(Task::once(TaskKind::Execute)).unwrap();
        let writer = dispatcher.spawn(Arc::clone(&session));
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.disconnect_reason(),
            Some(DisconnectReason::ProtocolError)
        );
        assert_eq!(session.pending_tasks(), 0);
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_task_cut_off_by_disconnect_is_counted_as_dropped() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry.clone());
        // Nobody reads the peer end, so a task larger than the pipe stalls mid-write.
        let (session, _peer) = connected(&registry).await;
        let big = "x".repeat(256 * 1024);
        session
            .enqueue(Task::once(TaskKind::Execute).with_args(big))
            .unwrap();
        let writer = dispatcher.spawn(Arc::clone(&session));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.pending_tasks(), 0);

        registry.retire(&session, DisconnectReason::Requested).await;
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatcher.dispatched(), 0);
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_exits_when_session_retired() {
        let registry = SessionRegistry::new();
        let dispatcher = TaskDispatcher::new(registry.clone());
        let (session, _peer) = connected(&registry).await;
        let writer = dispatcher.spawn(Arc::clone(&session));

        registry.retire(&session, DisconnectReason::Requested).await;
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
    }
}
