//! Mediator configuration, as stored in `~/.lime/mediator.toml`.

use crate::agent::{AgentId, AgentIdentity, Thumbprint};
use crate::error::{LimeError, LimeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default listen port for agent connections.
pub const DEFAULT_PORT: u16 = 55123;

/// Default cap on a single packet payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u32 = 1024 * 1024;

/// Top-level mediator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Address the agent listener binds to.
    pub listen_addr: SocketAddr,
    /// Largest accepted packet payload in bytes.
    pub max_payload_bytes: u32,
    /// Window for the application-level handshake challenge.
    pub handshake_timeout_secs: u64,
    /// Window for TLS negotiation.
    pub tls_timeout_secs: u64,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Mediator certificate and trust anchor.
    pub certificates: CertificateSettings,
    /// Registered agents.
    pub agents: Vec<AgentRecord>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            handshake_timeout_secs: 10,
            tls_timeout_secs: 10,
            heartbeat: HeartbeatSettings::default(),
            certificates: CertificateSettings::default(),
            agents: Vec::new(),
        }
    }
}

/// Heartbeat settings, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// How often the sweep runs.
    pub interval_secs: u64,
    /// How long a probe waits for its echo.
    pub timeout_secs: u64,
    /// Grace added to `timeout_secs` before a stale session is evicted.
    pub margin_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 15,
            margin_secs: 5,
        }
    }
}

/// Certificate material locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    /// PEM certificate chain presented by the mediator (leaf first).
    pub server_cert: PathBuf,
    /// PEM private key for `server_cert`.
    pub server_key: PathBuf,
    /// PEM root certificate that agent chains must lead to.
    pub root_cert: PathBuf,
    /// Expected thumbprint of `root_cert`.
    pub trusted_root_thumbprint: Option<Thumbprint>,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        let base = lime_home();
        Self {
            server_cert: base.join("certs").join("mediator.pem"),
            server_key: base.join("certs").join("mediator.key"),
            root_cert: base.join("certs").join("root.pem"),
            trusted_root_thumbprint: None,
        }
    }
}

/// A registered agent: where it connects from and which certificate it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub address: IpAddr,
    pub thumbprint: Thumbprint,
}

impl AgentRecord {
    /// The identity handed to the gateway for this record.
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            id: self.id,
            name: self.name.clone(),
            thumbprint: self.thumbprint.clone(),
        }
    }
}

impl MediatorConfig {
    /// Default config file location (`~/.lime/mediator.toml`).
    pub fn default_path() -> PathBuf {
        lime_home().join("mediator.toml")
    }

    /// Probe interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    /// Probe wait.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout_secs)
    }

    /// Staleness margin.
    pub fn heartbeat_margin(&self) -> Duration {
        Duration::from_secs(self.heartbeat.margin_secs)
    }

    /// Handshake challenge window.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// TLS negotiation window.
    pub fn tls_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_timeout_secs)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> LimeResult<()> {
        if self.heartbeat.interval_secs == 0 {
            return Err(LimeError::Config(
                "heartbeat.interval_secs must be greater than 0".into(),
            ));
        }
        if self.heartbeat.timeout_secs == 0 {
            return Err(LimeError::Config(
                "heartbeat.timeout_secs must be greater than 0".into(),
            ));
        }
        let stale_window = self.heartbeat.timeout_secs.saturating_add(self.heartbeat.margin_secs);
        if self.heartbeat.interval_secs > stale_window {
            return Err(LimeError::Config(
                "heartbeat.interval_secs must not exceed timeout_secs + margin_secs".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(LimeError::Config(
                "max_payload_bytes must be greater than 0".into(),
            ));
        }
        if self.handshake_timeout_secs == 0 || self.tls_timeout_secs == 0 {
            return Err(LimeError::Config(
                "handshake and TLS timeouts must be greater than 0".into(),
            ));
        }

        let mut addresses = HashSet::new();
        let mut ids = HashSet::new();
        for agent in &self.agents {
            if !addresses.insert(agent.address) {
                return Err(LimeError::Config(format!(
                    "address {} is registered to more than one agent",
                    agent.address
                )));
            }
            if !ids.insert(agent.id) {
                return Err(LimeError::Config(format!(
                    "agent id {} is registered more than once",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

fn lime_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".lime"))
        .unwrap_or_else(|| PathBuf::from(".lime"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MediatorConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.heartbeat.interval_secs, 15);
        assert_eq!(config.heartbeat.timeout_secs, 15);
        assert_eq!(config.heartbeat.margin_secs, 5);
        assert_eq!(config.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            listen_addr = "127.0.0.1:6000"

            [heartbeat]
            interval_secs = 3

            [certificates]
            trusted_root_thumbprint = "ab:cd"

            [[agents]]
            id = "6c1a3b52-8f0e-4a51-9c57-1d0f1d1e8a10"
            name = "build-01"
            address = "10.0.0.21"
            thumbprint = "9f86d0"
        "#;
        let config: MediatorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen_addr.port(), 6000);
        assert_eq!(config.heartbeat.interval_secs, 3);
        assert_eq!(config.heartbeat.timeout_secs, 15);
        assert_eq!(
            config.certificates.trusted_root_thumbprint.unwrap().as_str(),
            "ABCD"
        );
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].thumbprint.as_str(), "9F86D0");
        assert_eq!(config.agents[0].identity().name, "build-01");
    }

    #[test]
    fn test_bad_thumbprint_rejected_at_parse() {
        let toml_str = r#"
            [[agents]]
            id = "6c1a3b52-8f0e-4a51-9c57-1d0f1d1e8a10"
            name = "x"
            address = "10.0.0.1"
            thumbprint = "not hex"
        "#;
        assert!(toml::from_str::<MediatorConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = MediatorConfig::default();
        config.heartbeat.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_interval_beyond_staleness_window() {
        let mut config = MediatorConfig::default();
        config.heartbeat.interval_secs = 21;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));

        config.heartbeat.interval_secs = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_address() {
        let mut config = MediatorConfig::default();
        let record = AgentRecord {
            id: AgentId::new(),
            name: "a".into(),
            address: "10.0.0.1".parse().unwrap(),
            thumbprint: Thumbprint::parse("AA").unwrap(),
        };
        let mut other = record.clone();
        other.id = AgentId::new();
        config.agents = vec![record, other];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than one agent"));
    }

    #[test]
    fn test_duration_accessors() {
        let config = MediatorConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.heartbeat_margin(), Duration::from_secs(5));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }
}
