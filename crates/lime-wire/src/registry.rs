//! Session registry: the set of live (`Connected`) sessions.
//!
//! Every add, remove and iteration goes through one `RwLock`. Iteration hands
//! out a cloned snapshot, so the heartbeat sweep and dispatch callers never
//! hold the lock across I/O. A session's transition to `Disconnected` happens
//! under the same write lock as its removal, so two code paths racing to
//! disconnect the same session produce exactly one winner.

use crate::error::WireResult;
use crate::session::{Session, SessionInfo};
use futures::future::join_all;
use lime_types::agent::AgentId;
use lime_types::session::{DisconnectReason, SessionState};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Thread-safe registry of live sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the handshake: `Handshaking → Connected` and insert.
    ///
    /// Any existing session for the same agent is superseded and disconnected
    /// with [`DisconnectReason::Requested`].
    pub async fn promote(&self, session: &Arc<Session>) -> WireResult<()> {
        let superseded: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            session.transition(SessionState::Connected)?;
            session.touch_heartbeat();

            let old: Vec<Arc<Session>> = sessions
                .values()
                .filter(|s| s.agent_id() == session.agent_id())
                .filter(|s| s.mark_disconnected(DisconnectReason::Requested))
                .cloned()
                .collect();
            for s in &old {
                sessions.remove(&s.id());
            }
            sessions.insert(session.id(), Arc::clone(session));
            old
        };

        for old in superseded {
            info!(
                session = %old.id(),
                agent = %old.agent_id(),
                replaced_by = %session.id(),
                "Session superseded by a new connection"
            );
            old.release(DisconnectReason::Requested).await;
        }
        Ok(())
    }

    /// Disconnect a session. Returns `true` only for the caller that actually
    /// performed the transition; later callers are no-ops.
    pub async fn retire(&self, session: &Session, reason: DisconnectReason) -> bool {
        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if !session.mark_disconnected(reason) {
                return false;
            }
            sessions.remove(&session.id());
        }

        let discarded = session.release(reason).await;
        if discarded > 0 {
            warn!(
                session = %session.id(),
                agent = %session.agent_id(),
                discarded,
                "Discarded undelivered tasks"
            );
        }
        info!(
            session = %session.id(),
            agent = %session.agent_id(),
            remote = %session.remote_addr(),
            reason = %reason,
            "Session disconnected"
        );
        true
    }

    /// Disconnect every live session concurrently. Returns how many were retired.
    pub async fn retire_all(&self, reason: DisconnectReason) -> usize {
        let sessions = self.snapshot();
        let results = join_all(sessions.iter().map(|s| self.retire(s, reason))).await;
        results.into_iter().filter(|retired| *retired).count()
    }

    /// Look up a session by ID.
    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(id).cloned()
    }

    /// The live session of an agent, if it is connected.
    pub fn find_by_agent(&self, agent_id: AgentId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .find(|s| s.agent_id() == agent_id && s.state() == SessionState::Connected)
            .cloned()
    }

    /// Copy of every registered session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().cloned().collect()
    }

    /// Listing of every connected agent, ordered by agent name.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.snapshot().iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        infos
    }

    /// Number of connected sessions.
    pub fn connected_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|s| s.state() == SessionState::Connected)
            .count()
    }

    /// Drop entries whose session is no longer `Connected`. Returns the number removed.
    pub fn compact(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.state() == SessionState::Connected);
        before - sessions.len()
    }
}
