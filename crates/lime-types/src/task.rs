//! Work pushed to agents and the results they stream back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work an agent is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum TaskKind {
    /// Measure system resources and report a `Statistic`.
    CollectStatistics = 0,
    /// Run the command line carried in the task arguments.
    Execute = 1,
}

impl TaskKind {
    /// Wire value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for TaskKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskKind::CollectStatistics),
            1 => Ok(TaskKind::Execute),
            other => Err(other),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::CollectStatistics => write!(f, "collect_statistics"),
            TaskKind::Execute => write!(f, "execute"),
        }
    }
}

/// Whether the agent runs the work once or keeps repeating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Sent as a `TASK` packet; executed once.
    #[default]
    Once,
    /// Sent as a `JOB` packet; the agent repeats it on its own schedule.
    Recurring,
}

/// One unit of work for an agent.
///
/// Tasks are consumed exactly once when written to the wire and are never
/// retried by the mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// What to do.
    pub kind: TaskKind,
    /// Optional argument string (e.g. a command line for `Execute`).
    #[serde(default)]
    pub args: Option<String>,
    /// One-shot task or recurring job.
    #[serde(default)]
    pub mode: TaskMode,
}

impl Task {
    /// A one-shot task without arguments.
    pub fn once(kind: TaskKind) -> Self {
        Self {
            kind,
            args: None,
            mode: TaskMode::Once,
        }
    }

    /// A recurring job without arguments.
    pub fn recurring(kind: TaskKind) -> Self {
        Self {
            kind,
            args: None,
            mode: TaskMode::Recurring,
        }
    }

    /// Attach an argument string.
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }
}

/// Which resource a statistic describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum StatisticKind {
    /// Physical memory, in bytes.
    Ram = 0,
    /// Processor load, in hundredths of a percent.
    Cpu = 1,
    /// Disk capacity, in bytes.
    Disk = 2,
}

impl StatisticKind {
    /// Wire value.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for StatisticKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatisticKind::Ram),
            1 => Ok(StatisticKind::Cpu),
            2 => Ok(StatisticKind::Disk),
            other => Err(other),
        }
    }
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticKind::Ram => write!(f, "ram"),
            StatisticKind::Cpu => write!(f, "cpu"),
            StatisticKind::Disk => write!(f, "disk"),
        }
    }
}

/// A measurement reported by an agent after running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistic {
    pub kind: StatisticKind,
    pub min: i64,
    pub max: i64,
    pub current: i64,
}
