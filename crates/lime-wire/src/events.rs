//! Mediator events for dashboards and status collaborators.

use chrono::{DateTime, Utc};
use lime_types::agent::AgentId;
use lime_types::session::DisconnectReason;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

/// Something that happened to an agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediatorEvent {
    /// An agent passed TLS and the handshake challenge.
    Connected {
        session_id: Uuid,
        agent_id: AgentId,
        agent_name: String,
        remote_addr: SocketAddr,
        at: DateTime<Utc>,
    },
    /// A connection was refused: unknown address, bad certificate, or a
    /// failed handshake challenge.
    AuthenticationFailed {
        remote_addr: SocketAddr,
        agent_id: Option<AgentId>,
        detail: String,
        at: DateTime<Utc>,
    },
    /// A registered session ended.
    Disconnected {
        session_id: Uuid,
        agent_id: AgentId,
        reason: DisconnectReason,
        at: DateTime<Utc>,
    },
}

/// Broadcast fan-out of [`MediatorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MediatorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish to every current subscriber. Dropped if nobody listens.
    pub fn publish(&self, event: MediatorEvent) {
        debug!(event = ?event, "Publishing mediator event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediatorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let event = MediatorEvent::Disconnected {
            session_id: Uuid::new_v4(),
            agent_id: AgentId::new(),
            reason: DisconnectReason::Timeout,
            at: Utc::now(),
        };
        bus.publish(event.clone());
        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(MediatorEvent::AuthenticationFailed {
            remote_addr: "10.0.0.9:4000".parse().unwrap(),
            agent_id: None,
            detail: "unknown address".into(),
            at: Utc::now(),
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = MediatorEvent::AuthenticationFailed {
            remote_addr: "10.0.0.9:4000".parse().unwrap(),
            agent_id: None,
            detail: "bad cert".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "authentication_failed");
    }
}
