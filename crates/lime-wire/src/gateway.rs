//! Mediator: the mutual-TLS listener that agents connect to.
//!
//! A [`Mediator`] binds a TCP listener and runs one task per accepted
//! connection:
//!
//! 1. Resolve the agent registered for the peer address (refuse unknown ones).
//! 2. Negotiate TLS 1.3 with a verifier bound to that agent's thumbprint.
//! 3. Run the handshake challenge.
//! 4. Register the session, start its task dispatcher, and read packets until
//!    the session ends.
//!
//! The [`MediatorHandle`] trait abstracts the collaborators outside the
//! protocol core: the agent directory, status recording and result storage.

use crate::dispatch::TaskDispatcher;
use crate::error::{WireError, WireResult};
use crate::events::{EventBus, MediatorEvent};
use crate::handshake;
use crate::heartbeat::{self, HeartbeatConfig};
use crate::packet::{read_packet, Packet};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInfo};
use crate::tls::{CertificateValidator, TlsMaterial};

use async_trait::async_trait;
use chrono::Utc;
use lime_types::agent::{AgentId, AgentIdentity, AgentStatus};
use lime_types::config::{MediatorConfig, DEFAULT_MAX_PAYLOAD_BYTES};
use lime_types::session::DisconnectReason;
use lime_types::task::{Statistic, Task};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for connection tasks to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a Mediator.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Largest accepted packet payload.
    pub max_payload_bytes: u32,
    /// Window for the handshake challenge.
    pub handshake_timeout: Duration,
    /// Window for TLS negotiation.
    pub tls_timeout: Duration,
    /// Liveness probing.
    pub heartbeat: HeartbeatConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            handshake_timeout: Duration::from_secs(10),
            tls_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl From<&MediatorConfig> for GatewayConfig {
    fn from(config: &MediatorConfig) -> Self {
        Self {
            listen_addr: config.listen_addr,
            max_payload_bytes: config.max_payload_bytes,
            handshake_timeout: config.handshake_timeout(),
            tls_timeout: config.tls_timeout(),
            heartbeat: HeartbeatConfig {
                interval: config.heartbeat_interval(),
                timeout: config.heartbeat_timeout(),
                margin: config.heartbeat_margin(),
            },
        }
    }
}

/// Collaborators the mediator calls out to.
#[async_trait]
pub trait MediatorHandle: Send + Sync + 'static {
    /// The agent registered for a network address, if any.
    async fn resolve_agent(&self, addr: IpAddr) -> Option<AgentIdentity>;

    /// Record an agent going online or offline. Failures are logged only.
    async fn record_agent_status(&self, agent: AgentId, status: AgentStatus)
        -> Result<(), String>;

    /// Store a statistic reported by an agent.
    async fn persist_task_result(&self, agent: AgentId, statistic: Statistic)
        -> Result<(), String>;
}

/// Point-in-time view of the mediator.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Address the listener is bound to.
    pub listen_addr: SocketAddr,
    /// Sessions currently in the registry.
    pub live_sessions: usize,
    /// Connections that completed the handshake since start.
    pub accepted: u64,
    /// Connections refused before reaching `Connected`.
    pub refused: u64,
    /// Tasks written to agents since start.
    pub tasks_dispatched: u64,
    /// Tasks lost mid-write to a disconnect.
    pub tasks_dropped: u64,
    /// Whether [`Mediator::shutdown`] has begun.
    pub shutting_down: bool,
}

/// The agent-facing network endpoint.
pub struct Mediator {
    config: GatewayConfig,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    registry: SessionRegistry,
    dispatcher: TaskDispatcher,
    events: EventBus,
    tls: TlsMaterial,
    validator: Arc<dyn CertificateValidator>,
    handle: Arc<dyn MediatorHandle>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    accepted: AtomicU64,
    refused: AtomicU64,
}

impl Mediator {
    /// Bind the listener and start the accept loop and heartbeat monitor.
    ///
    /// The returned handle completes once the accept loop has stopped and
    /// in-flight connections have drained after [`Mediator::shutdown`].
    pub async fn start(
        config: GatewayConfig,
        tls: TlsMaterial,
        handle: Arc<dyn MediatorHandle>,
        validator: Arc<dyn CertificateValidator>,
    ) -> WireResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listen = %local_addr,
            root = %tls.root_thumbprint(),
            "LIME mediator listening"
        );

        let registry = SessionRegistry::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let heartbeat_task = heartbeat::spawn_monitor(
            registry.clone(),
            config.heartbeat.clone(),
            shutdown_rx.clone(),
        );

        let mediator = Arc::new(Self {
            config,
            local_addr,
            dispatcher: TaskDispatcher::new(registry.clone()),
            registry,
            events: EventBus::new(),
            tls,
            validator,
            handle,
            shutdown_tx,
            heartbeat_task: Mutex::new(Some(heartbeat_task)),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        });

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&mediator),
            shutdown_rx,
        ));

        Ok((mediator, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Every connected agent.
    pub fn list_connected_agents(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Queue work for a connected agent.
    pub fn enqueue_task(&self, agent_id: AgentId, task: Task) -> WireResult<()> {
        if self.is_shutting_down() {
            return Err(WireError::NotConnected(agent_id.to_string()));
        }
        self.dispatcher.enqueue(agent_id, task)
    }

    /// Ask a connected agent to leave. Returns `false` if it was not connected.
    pub async fn disconnect_agent(&self, agent_id: AgentId) -> bool {
        match self.registry.find_by_agent(agent_id) {
            Some(session) => {
                self.registry
                    .retire(&session, DisconnectReason::Requested)
                    .await
            }
            None => false,
        }
    }

    /// Receive connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<MediatorEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            listen_addr: self.local_addr,
            live_sessions: self.registry.connected_count(),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            tasks_dispatched: self.dispatcher.dispatched(),
            tasks_dropped: self.dispatcher.dropped(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stop accepting, stop the heartbeat monitor, and disconnect every live
    /// session with [`DisconnectReason::Requested`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("LIME mediator shutting down");

        let retired = self.registry.retire_all(DisconnectReason::Requested).await;
        info!(sessions = retired, "Disconnected all sessions");

        let heartbeat_task = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = heartbeat_task {
            let _ = task.await;
        }
    }

    /// Internal accept loop: runs in a spawned task.
    async fn accept_loop(
        listener: TcpListener,
        mediator: Arc<Mediator>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(remote = %addr, "Accepted connection");
                        let mediator = Arc::clone(&mediator);
                        connections.spawn(async move {
                            mediator.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    info!("Accept loop: shutdown signal received");
                    break;
                }
            }
        }
        drop(listener);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still open after shutdown, aborting"
            );
            connections.abort_all();
        }
    }

    fn refuse(&self, remote_addr: SocketAddr, agent_id: Option<AgentId>, detail: String) {
        self.refused.fetch_add(1, Ordering::Relaxed);
        warn!(remote = %remote_addr, agent = ?agent_id, detail = %detail, "Connection refused");
        self.events.publish(MediatorEvent::AuthenticationFailed {
            remote_addr,
            agent_id,
            detail,
            at: Utc::now(),
        });
    }

    /// Drive one connection from accept to disconnect.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let Some(identity) = self.handle.resolve_agent(agent_address(addr)).await else {
            self.refuse(addr, None, "no agent registered for this address".into());
            return;
        };
        let agent_id = identity.id;

        let server_config = match self
            .tls
            .server_config(&identity, Arc::clone(&self.validator))
        {
            Ok(c) => c,
            Err(e) => {
                error!(agent = %agent_id, error = %e, "Cannot build TLS config");
                return;
            }
        };

        let session = Arc::new(Session::new(addr, identity));
        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream =
            match tokio::time::timeout(self.config.tls_timeout, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    self.registry
                        .retire(&session, DisconnectReason::AuthenticationFailed)
                        .await;
                    self.refuse(addr, Some(agent_id), format!("TLS negotiation failed: {e}"));
                    return;
                }
                Err(_) => {
                    self.registry
                        .retire(&session, DisconnectReason::Timeout)
                        .await;
                    self.refuse(addr, Some(agent_id), "TLS negotiation timed out".into());
                    return;
                }
            };

        let (mut reader, writer) = tokio::io::split(tls_stream);
        if let Err(e) = session.begin_handshake(Box::new(writer)) {
            self.registry.retire(&session, e.disconnect_reason()).await;
            return;
        }

        if let Err(e) = handshake::challenge(
            &session,
            &mut reader,
            self.config.max_payload_bytes,
            self.config.handshake_timeout,
        )
        .await
        {
            let reason = e.disconnect_reason();
            self.registry.retire(&session, reason).await;
            self.refuse(addr, Some(agent_id), format!("handshake failed: {e}"));
            return;
        }

        if let Err(e) = self.registry.promote(&session).await {
            self.registry.retire(&session, e.disconnect_reason()).await;
            return;
        }
        if self.is_shutting_down() {
            // Promoted after shutdown swept the registry.
            self.registry
                .retire(&session, DisconnectReason::Requested)
                .await;
            return;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            session = %session.id(),
            agent = %agent_id,
            name = %session.identity().name,
            remote = %addr,
            "Agent connected"
        );
        if let Err(e) = self
            .handle
            .record_agent_status(agent_id, AgentStatus::Online)
            .await
        {
            warn!(agent = %agent_id, error = %e, "Failed to record agent status");
        }
        self.events.publish(MediatorEvent::Connected {
            session_id: session.id(),
            agent_id,
            agent_name: session.identity().name.clone(),
            remote_addr: addr,
            at: Utc::now(),
        });

        let dispatcher_task = self.dispatcher.spawn(Arc::clone(&session));

        if let Some(reason) = self.read_loop(&session, &mut reader).await {
            self.registry.retire(&session, reason).await;
        }
        let _ = dispatcher_task.await;
        self.finalize(&session).await;
    }

    /// Read packets until the peer misbehaves, leaves, or the session is
    /// closed elsewhere. Returns the reason when this loop ended the session.
    async fn read_loop<R>(&self, session: &Session, reader: &mut R) -> Option<DisconnectReason>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let packet = tokio::select! {
                res = read_packet(reader, self.config.max_payload_bytes) => res,
                _ = session.closed() => return None,
            };

            match packet {
                Ok(Packet::Heartbeat(payload)) => {
                    if !session.complete_probe(payload) {
                        debug!(session = %session.id(), "Unsolicited heartbeat ignored");
                    }
                }
                Ok(Packet::Statistic(statistic)) => {
                    debug!(
                        session = %session.id(),
                        kind = %statistic.kind,
                        current = statistic.current,
                        "Statistic received"
                    );
                    if let Err(e) = self
                        .handle
                        .persist_task_result(session.agent_id(), statistic)
                        .await
                    {
                        warn!(agent = %session.agent_id(), error = %e, "Failed to persist statistic");
                    }
                }
                Ok(Packet::Disconnect(text)) => {
                    info!(session = %session.id(), text = %text, "Agent requested disconnect");
                    return Some(DisconnectReason::Requested);
                }
                Ok(other) => {
                    warn!(
                        session = %session.id(),
                        opcode = %other.opcode(),
                        "Unexpected packet from agent"
                    );
                    return Some(DisconnectReason::ProtocolError);
                }
                Err(WireError::ConnectionClosed) => {
                    debug!(session = %session.id(), "Agent closed the connection");
                    return Some(DisconnectReason::Unknown);
                }
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Read failed");
                    return Some(e.disconnect_reason());
                }
            }
        }
    }

    /// Publish the disconnect and mark the agent offline, unless a newer
    /// session for the same agent has already taken over.
    async fn finalize(&self, session: &Session) {
        let reason = session
            .disconnect_reason()
            .unwrap_or(DisconnectReason::Unknown);
        let agent_id = session.agent_id();
        self.events.publish(MediatorEvent::Disconnected {
            session_id: session.id(),
            agent_id,
            reason,
            at: Utc::now(),
        });

        if self.registry.find_by_agent(agent_id).is_none() {
            if let Err(e) = self
                .handle
                .record_agent_status(agent_id, AgentStatus::Offline)
                .await
            {
                warn!(agent = %agent_id, error = %e, "Failed to record agent status");
            }
        }
    }
}

/// Directory lookup key for a peer. A dual-stack listener reports IPv4
/// agents as `::ffff:a.b.c.d`; those are registered by their IPv4 address.
fn agent_address(addr: SocketAddr) -> IpAddr {
    addr.ip().to_canonical()
}
