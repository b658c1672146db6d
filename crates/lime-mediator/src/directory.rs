//! Agent directory backed by the `[[agents]]` section of the configuration.
//!
//! Registration records are static for the life of the process. Status
//! changes and reported statistics are kept in memory and logged; there is
//! no database behind this directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lime_types::agent::{AgentId, AgentIdentity, AgentStatus};
use lime_types::config::AgentRecord;
use lime_types::error::{LimeError, LimeResult};
use lime_types::task::{Statistic, StatisticKind};
use lime_wire::MediatorHandle;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::info;

/// Most recent statistic of one kind for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestStatistic {
    pub statistic: Statistic,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConfigDirectory {
    by_address: HashMap<IpAddr, AgentIdentity>,
    statuses: RwLock<HashMap<AgentId, AgentStatus>>,
    latest: RwLock<HashMap<(AgentId, StatisticKind), LatestStatistic>>,
}

impl ConfigDirectory {
    pub fn from_records(records: &[AgentRecord]) -> Self {
        Self {
            by_address: records
                .iter()
                .map(|r| (r.address, r.identity()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Last recorded status, `Offline` for agents never seen.
    pub fn status(&self, agent: AgentId) -> AgentStatus {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&agent)
            .copied()
            .unwrap_or(AgentStatus::Offline)
    }

    pub fn latest(&self, agent: AgentId, kind: StatisticKind) -> Option<LatestStatistic> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(agent, kind))
            .cloned()
    }

    /// Registration for an agent id.
    pub fn identity(&self, agent: AgentId) -> LimeResult<AgentIdentity> {
        self.by_address
            .values()
            .find(|identity| identity.id == agent)
            .cloned()
            .ok_or_else(|| LimeError::AgentNotFound(agent.to_string()))
    }

    fn name_of(&self, agent: AgentId) -> String {
        self.identity(agent)
            .map(|identity| identity.name)
            .unwrap_or_else(|_| agent.to_string())
    }
}

#[async_trait]
impl MediatorHandle for ConfigDirectory {
    async fn resolve_agent(&self, addr: IpAddr) -> Option<AgentIdentity> {
        self.by_address.get(&addr).cloned()
    }

    async fn record_agent_status(
        &self,
        agent: AgentId,
        status: AgentStatus,
    ) -> Result<(), String> {
        info!(agent = %agent, name = %self.name_of(agent), status = ?status, "Agent status");
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent, status);
        Ok(())
    }

    async fn persist_task_result(
        &self,
        agent: AgentId,
        statistic: Statistic,
    ) -> Result<(), String> {
        info!(
            agent = %agent,
            name = %self.name_of(agent),
            kind = %statistic.kind,
            min = statistic.min,
            max = statistic.max,
            current = statistic.current,
            "Statistic"
        );
        self.latest
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (agent, statistic.kind),
                LatestStatistic {
                    statistic,
                    received_at: Utc::now(),
                },
            );
        Ok(())
    }
}
