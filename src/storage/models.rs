//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{NodeState, RunState, Trigger};

/// Stored flow record. `source` is the flow DSL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFlow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: String,
    pub status: FlowStatus,
    /// Latest version number
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operational status of a stored flow, updated as its runs finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Idle,
    Running,
    Error,
    Stopped,
}

impl FlowStatus {
    /// Status a flow is left in by a run that ended in `state`.
    pub fn after_run(state: RunState) -> Self {
        match state {
            RunState::Pending | RunState::Running => Self::Running,
            RunState::Succeeded => Self::Idle,
            RunState::Failed => Self::Error,
            RunState::Cancelled => Self::Stopped,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Unknown flow status: {}", s)),
        }
    }
}

/// Stored flow version snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub version: u32,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

/// Run summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub flow_version: u32,
    pub state: RunState,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StoredRun {
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Per-node record of a stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNodeRun {
    pub run_id: String,
    pub node_name: String,
    pub node_type: String,
    pub state: NodeState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub outputs: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}
