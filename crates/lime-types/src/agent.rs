//! Agent identity types.

use crate::error::LimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Generate a new random agent ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| LimeError::InvalidInput(format!("invalid agent id '{s}': {e}")))
    }
}

/// A certificate fingerprint, stored as uppercase hex without separators.
///
/// Parsing accepts lowercase hex and the common `AB:CD:..` / `AB CD ..`
/// presentations, so values copied from other tools compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Parse a thumbprint from its textual form.
    pub fn parse(s: &str) -> Result<Self, LimeError> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ':' | ' ' | '-'))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() {
            return Err(LimeError::InvalidInput("empty thumbprint".to_string()));
        }
        if normalized.len() % 2 != 0 || hex::decode(&normalized).is_err() {
            return Err(LimeError::InvalidInput(format!(
                "thumbprint '{s}' is not a hex digest"
            )));
        }
        Ok(Self(normalized))
    }

    /// Build a thumbprint from raw digest bytes.
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode_upper(digest))
    }

    /// The normalized hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Thumbprint {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Thumbprint {
    type Error = LimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Thumbprint> for String {
    fn from(value: Thumbprint) -> Self {
        value.0
    }
}

/// What the mediator knows about an agent before it connects: who it is and
/// which certificate it must present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Registered agent ID.
    pub id: AgentId,
    /// Human-readable name.
    pub name: String,
    /// Expected thumbprint of the agent's leaf certificate.
    pub thumbprint: Thumbprint,
}

/// Availability reported to the status collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The agent passed the handshake and has a live session.
    Online,
    /// The agent's session ended.
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}
