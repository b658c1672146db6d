//! Shared fixtures for the TLS integration tests: a throwaway PKI, a
//! recording agent directory, and a statistics runner.

#![allow(dead_code)]

use async_trait::async_trait;
use lime_types::agent::{AgentId, AgentIdentity, AgentStatus};
use lime_types::task::{Statistic, StatisticKind, Task, TaskKind};
use lime_wire::handshake;
use lime_wire::tls::TlsMaterial;
use lime_wire::{GatewayConfig, HeartbeatConfig, Mediator, MediatorHandle, TaskRunner};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[path = "../../src/testutil.rs"]
mod testutil;

pub use testutil::TestCa;

pub const LOOPBACK: [u8; 4] = [127, 0, 0, 1];

/// RAM statistic every test runner reports.
pub const RAM: Statistic = Statistic {
    kind: StatisticKind::Ram,
    min: 0,
    max: 16_000_000_000,
    current: 4_200_000_000,
};

/// Directory keyed by address that records every status change and result.
pub struct RecordingDirectory {
    agents: HashMap<IpAddr, AgentIdentity>,
    pub statuses: Mutex<Vec<(AgentId, AgentStatus)>>,
    results: mpsc::UnboundedSender<(AgentId, Statistic)>,
}

impl RecordingDirectory {
    pub fn new(
        agents: Vec<(IpAddr, AgentIdentity)>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(AgentId, Statistic)>) {
        let (results, rx) = mpsc::unbounded_channel();
        let directory = Arc::new(Self {
            agents: agents.into_iter().collect(),
            statuses: Mutex::new(Vec::new()),
            results,
        });
        (directory, rx)
    }

    pub fn statuses(&self) -> Vec<(AgentId, AgentStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediatorHandle for RecordingDirectory {
    async fn resolve_agent(&self, addr: IpAddr) -> Option<AgentIdentity> {
        self.agents.get(&addr).cloned()
    }

    async fn record_agent_status(&self, agent: AgentId, status: AgentStatus) -> Result<(), String> {
        self.statuses.lock().unwrap().push((agent, status));
        Ok(())
    }

    async fn persist_task_result(
        &self,
        agent: AgentId,
        statistic: Statistic,
    ) -> Result<(), String> {
        self.results
            .send((agent, statistic))
            .map_err(|e| e.to_string())
    }
}

/// Answers `CollectStatistics` with [`RAM`]; everything else yields nothing.
pub struct StatsRunner;

#[async_trait]
impl TaskRunner for StatsRunner {
    async fn run(&self, task: &Task) -> Result<Option<Statistic>, String> {
        match task.kind {
            TaskKind::CollectStatistics => Ok(Some(RAM)),
            TaskKind::Execute => Ok(None),
        }
    }
}

pub fn identity(name: &str, material: &TlsMaterial) -> AgentIdentity {
    AgentIdentity {
        id: AgentId::new(),
        name: name.to_string(),
        thumbprint: material.leaf_thumbprint(),
    }
}

pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        handshake_timeout: Duration::from_secs(5),
        tls_timeout: Duration::from_secs(5),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(500),
            margin: Duration::from_secs(1),
        },
        ..GatewayConfig::default()
    }
}

pub async fn start(
    config: GatewayConfig,
    server: TlsMaterial,
    directory: Arc<RecordingDirectory>,
) -> (Arc<Mediator>, tokio::task::JoinHandle<()>) {
    let validator = Arc::new(server.root_validator());
    Mediator::start(config, server, directory, validator)
        .await
        .unwrap()
}

pub type RawReader = ReadHalf<TlsStream<TcpStream>>;
pub type RawWriter = WriteHalf<TlsStream<TcpStream>>;

/// An authenticated connection past the handshake, with no agent loop behind
/// it, for writing arbitrary frames at the mediator.
pub async fn raw_session(addr: SocketAddr, tls: &TlsMaterial) -> (RawReader, RawWriter) {
    let connector = TlsConnector::from(tls.client_config().unwrap());
    let stream = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let stream = connector.connect(server_name, stream).await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(stream);
    handshake::respond(&mut reader, &mut writer, 1024 * 1024, Duration::from_secs(5))
        .await
        .unwrap();
    (reader, writer)
}
