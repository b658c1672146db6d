//! Agent-side client.
//!
//! [`AgentClient`] dials a mediator with a client certificate, answers the
//! handshake challenge, and then serves the session: heartbeat nonces are
//! echoed, tasks are handed to a [`TaskRunner`] and any resulting
//! [`Statistic`] is streamed back. Recurring jobs are re-run on
//! [`AgentConfig::job_interval`].

use crate::error::{WireError, WireResult};
use crate::handshake;
use crate::packet::{read_packet, write_packet, Opcode, Packet};
use crate::tls::TlsMaterial;

use async_trait::async_trait;
use lime_types::config::DEFAULT_MAX_PAYLOAD_BYTES;
use lime_types::task::{Statistic, Task, TaskMode};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

type ClientStream = TlsStream<TcpStream>;

/// Packets buffered between the reader task and the session loop.
const READ_BUFFER: usize = 32;

/// Where and how an agent connects.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mediator_addr: SocketAddr,
    /// Name checked against the mediator's certificate.
    pub server_name: String,
    pub max_payload_bytes: u32,
    pub handshake_timeout: Duration,
    /// Delay between runs of a recurring job.
    pub job_interval: Duration,
}

impl AgentConfig {
    pub fn new(mediator_addr: SocketAddr) -> Self {
        Self {
            mediator_addr,
            server_name: "localhost".to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            handshake_timeout: Duration::from_secs(10),
            job_interval: Duration::from_secs(60),
        }
    }
}

/// Executes the work a mediator pushes to this agent.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task. `Ok(Some(_))` is reported back to the mediator.
    async fn run(&self, task: &Task) -> Result<Option<Statistic>, String>;
}

/// A connected, authenticated agent session.
pub struct AgentClient {
    config: AgentConfig,
    reader: Option<ReadHalf<ClientStream>>,
    writer: WriteHalf<ClientStream>,
    jobs: Vec<Task>,
}

impl AgentClient {
    /// Connect, negotiate TLS and answer the handshake challenge.
    pub async fn connect(config: AgentConfig, tls: &TlsMaterial) -> WireResult<Self> {
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|e| WireError::Tls(format!("invalid server name: {e}")))?;
        let connector = TlsConnector::from(tls.client_config()?);

        let stream = TcpStream::connect(config.mediator_addr).await?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| WireError::Tls(e.to_string()))?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        handshake::respond(
            &mut reader,
            &mut writer,
            config.max_payload_bytes,
            config.handshake_timeout,
        )
        .await?;
        info!(mediator = %config.mediator_addr, "Connected to mediator");

        Ok(Self {
            config,
            reader: Some(reader),
            writer,
            jobs: Vec::new(),
        })
    }

    /// Serve the session until the mediator disconnects us or `shutdown`
    /// flips to `true`. Returns the disconnect text.
    ///
    /// Tasks run inline, so a slow runner also delays heartbeat replies.
    pub async fn run(
        mut self,
        runner: &dyn TaskRunner,
        mut shutdown: watch::Receiver<bool>,
    ) -> WireResult<String> {
        // Frames are read on their own task; a half-read frame must never be
        // dropped by the select below.
        let (packet_tx, mut packets) = mpsc::channel(READ_BUFFER);
        let max_payload = self.config.max_payload_bytes;
        let mut reader = self.reader.take();
        let read_task = tokio::spawn(async move {
            let Some(reader) = reader.as_mut() else {
                return;
            };
            loop {
                let packet = read_packet(reader, max_payload).await;
                let failed = packet.is_err();
                if packet_tx.send(packet).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.serve(runner, &mut packets, &mut shutdown).await;
        read_task.abort();
        result
    }

    async fn serve(
        &mut self,
        runner: &dyn TaskRunner,
        packets: &mut mpsc::Receiver<WireResult<Packet>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WireResult<String> {
        let mut jobs_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.job_interval,
            self.config.job_interval,
        );
        jobs_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = packets.recv() => {
                    let Some(packet) = packet else {
                        return Err(WireError::ConnectionClosed);
                    };
                    match packet? {
                        Packet::Heartbeat(nonce) => {
                            write_packet(&mut self.writer, &Packet::Heartbeat(nonce)).await?;
                        }
                        Packet::Task(task) => {
                            debug!(kind = %task.kind, mode = ?task.mode, "Task received");
                            self.execute(runner, &task).await?;
                            if task.mode == TaskMode::Recurring {
                                self.jobs.push(task);
                            }
                        }
                        Packet::Disconnect(text) => {
                            info!(text = %text, "Mediator closed the session");
                            return Ok(text);
                        }
                        other => {
                            return Err(WireError::UnexpectedPacket {
                                expected: Opcode::Task,
                                got: other.opcode(),
                            });
                        }
                    }
                }
                _ = jobs_timer.tick(), if !self.jobs.is_empty() => {
                    let jobs = self.jobs.clone();
                    for job in &jobs {
                        self.execute(runner, job).await?;
                    }
                }
                Ok(()) = shutdown.changed() => {
                    return self.disconnect("Agent shutting down.").await;
                }
            }
        }
    }

    /// Tell the mediator we are leaving and close the transport.
    pub async fn disconnect(&mut self, text: &str) -> WireResult<String> {
        write_packet(&mut self.writer, &Packet::Disconnect(text.to_string())).await?;
        let _ = self.writer.shutdown().await;
        Ok(text.to_string())
    }

    /// Recurring jobs this agent is currently repeating.
    pub fn jobs(&self) -> &[Task] {
        &self.jobs
    }

    async fn execute(&mut self, runner: &dyn TaskRunner, task: &Task) -> WireResult<()> {
        match runner.run(task).await {
            Ok(Some(statistic)) => {
                write_packet(&mut self.writer, &Packet::Statistic(statistic)).await
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(kind = %task.kind, error = %e, "Task failed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("mediator", &self.config.mediator_addr)
            .field("jobs", &self.jobs.len())
            .finish()
    }
}
