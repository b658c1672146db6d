//! Heartbeat monitor: active liveness probing of connected agents.
//!
//! Every `interval` the monitor runs one sweep over a snapshot of the
//! registry:
//!
//! 1. Sessions whose last proof of life is older than `timeout + margin` are
//!    disconnected with [`DisconnectReason::Timeout`].
//! 2. Every remaining session gets a `HEARTBEAT` carrying a fresh random
//!    nonce and must echo it within `timeout`. No echo or a different nonce
//!    also disconnects with `Timeout`.
//!
//! Probes run concurrently, so one slow agent never delays the others.
//! Sweeps start on a fixed cadence: a sweep held up by a silent agent does
//! not push the next one back by a further `interval`, so a responsive
//! session is checked again before it can age past `timeout + margin`.

use crate::handshake::tokens_match;
use crate::packet::Packet;
use crate::registry::SessionRegistry;
use crate::session::Session;
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use lime_types::agent::AgentId;
use lime_types::session::DisconnectReason;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Heartbeat nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// Heartbeat monitor configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often a sweep runs.
    pub interval: Duration,
    /// How long a probe waits for its echo.
    pub timeout: Duration,
    /// Extra grace before a silent session counts as stale.
    pub margin: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(15),
            margin: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.timeout + self.margin).unwrap_or(chrono::Duration::MAX)
    }
}

/// How one session fared in a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Echo matched.
    Alive { rtt_ms: u64 },
    /// Silent for longer than `timeout + margin`; evicted without probing.
    Stale { silent_secs: i64 },
    /// No echo within the timeout.
    NoReply,
    /// Echo did not match the nonce.
    Mismatch,
    /// The probe could not be written.
    SendFailed(String),
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Alive { .. })
    }
}

/// Result of checking one session.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    pub session_id: Uuid,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub outcome: ProbeOutcome,
}

/// Aggregate sweep summary.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatSummary {
    /// Sessions checked.
    pub total_checked: usize,
    /// Sessions that answered.
    pub responsive: usize,
    /// Sessions disconnected by this sweep.
    pub evicted: usize,
    /// Details of evicted sessions.
    pub evicted_sessions: Vec<HeartbeatStatus>,
}

/// Produce a summary from sweep statuses.
pub fn summarize(statuses: &[HeartbeatStatus]) -> HeartbeatSummary {
    let evicted_sessions: Vec<HeartbeatStatus> = statuses
        .iter()
        .filter(|s| !s.outcome.is_alive())
        .cloned()
        .collect();

    HeartbeatSummary {
        total_checked: statuses.len(),
        responsive: statuses.len() - evicted_sessions.len(),
        evicted: evicted_sessions.len(),
        evicted_sessions,
    }
}

fn generate_nonce() -> Bytes {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    Bytes::copy_from_slice(&nonce)
}

/// Send one probe and wait for its echo. The echo is delivered by the
/// session's read loop through [`Session::complete_probe`].
pub async fn probe(session: &Session, timeout: Duration) -> ProbeOutcome {
    let nonce = generate_nonce();
    let reply = session.begin_probe(nonce.clone());
    let started = Instant::now();

    let exchange = async {
        session.send(&Packet::Heartbeat(nonce.clone())).await?;
        Ok::<_, crate::error::WireError>(reply.await)
    };

    let outcome = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(Ok(echo))) if tokens_match(&nonce, &echo) => {
            session.touch_heartbeat();
            ProbeOutcome::Alive {
                rtt_ms: started.elapsed().as_millis() as u64,
            }
        }
        Ok(Ok(Ok(_))) => ProbeOutcome::Mismatch,
        // Probe slot was dropped (session released underneath us).
        Ok(Ok(Err(_))) => ProbeOutcome::NoReply,
        Ok(Err(e)) => ProbeOutcome::SendFailed(e.to_string()),
        Err(_) => ProbeOutcome::NoReply,
    };
    if !outcome.is_alive() {
        session.cancel_probe();
    }
    outcome
}

/// Run one sweep: evict stale sessions, probe the rest, compact the registry.
pub async fn sweep(registry: &SessionRegistry, config: &HeartbeatConfig) -> Vec<HeartbeatStatus> {
    let now = Utc::now();
    let stale_after = config.stale_after();
    let (stale, live): (Vec<Arc<Session>>, Vec<Arc<Session>>) = registry
        .snapshot()
        .into_iter()
        .partition(|s| now - s.last_heartbeat() > stale_after);

    let mut statuses = Vec::with_capacity(stale.len() + live.len());

    for session in &stale {
        let silent_secs = (now - session.last_heartbeat()).num_seconds();
        warn!(
            session = %session.id(),
            agent = %session.agent_id(),
            silent_secs,
            "Heartbeat stale, disconnecting"
        );
        statuses.push(status(session, ProbeOutcome::Stale { silent_secs }));
    }
    join_all(
        stale
            .iter()
            .map(|s| registry.retire(s, DisconnectReason::Timeout)),
    )
    .await;

    let outcomes = join_all(live.iter().map(|s| async move {
        let outcome = probe(s, config.timeout).await;
        if !outcome.is_alive() {
            warn!(
                session = %s.id(),
                agent = %s.agent_id(),
                outcome = ?outcome,
                "Heartbeat probe failed, disconnecting"
            );
            registry.retire(s, DisconnectReason::Timeout).await;
        } else {
            debug!(session = %s.id(), outcome = ?outcome, "Heartbeat OK");
        }
        outcome
    }))
    .await;

    for (session, outcome) in live.iter().zip(outcomes) {
        statuses.push(status(session, outcome));
    }

    registry.compact();
    statuses
}

fn status(session: &Session, outcome: ProbeOutcome) -> HeartbeatStatus {
    HeartbeatStatus {
        session_id: session.id(),
        agent_id: session.agent_id(),
        agent_name: session.identity().name.clone(),
        outcome,
    }
}

/// Spawn the periodic monitor. It stops when `shutdown` flips.
pub fn spawn_monitor(
    registry: SessionRegistry,
    config: HeartbeatConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    info!(
        interval_secs = config.interval.as_secs(),
        timeout_secs = config.timeout.as_secs(),
        margin_secs = config.margin.as_secs(),
        "Starting heartbeat monitor"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Heartbeat monitor: shutdown signal received");
                    break;
                }
            }

            let statuses = sweep(&registry, &config).await;
            let summary = summarize(&statuses);
            if summary.evicted > 0 {
                info!(
                    checked = summary.total_checked,
                    responsive = summary.responsive,
                    evicted = summary.evicted,
                    "Heartbeat sweep complete"
                );
            } else {
                debug!(checked = summary.total_checked, "Heartbeat sweep complete");
            }
        }
    })
}
