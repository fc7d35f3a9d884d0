//! Run and node state, as observed through snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            "cancelled" => Ok(RunState::Cancelled),
            _ => Err(format!("Unknown run state: {}", s)),
        }
    }
}

/// Lifecycle of one node within a run.
///
/// `Failed { retryable: true }` is the resting state between attempts; the
/// node goes back to `Running` for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed { retryable: bool },
    Skipped,
    Cancelled,
}

impl NodeState {
    pub const FAILED: NodeState = NodeState::Failed { retryable: false };
    pub const RETRYING: NodeState = NodeState::Failed { retryable: true };

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;

        matches!(
            (*self, next),
            (Pending, Ready | Skipped | Cancelled)
                | (Ready, Running | Cancelled)
                | (Running, Succeeded | Failed { .. } | Cancelled)
                | (Failed { retryable: true }, Running | Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded
                | NodeState::Failed { retryable: false }
                | NodeState::Skipped
                | NodeState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed { retryable: false } => "failed",
            NodeState::Failed { retryable: true } => "retrying",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeState::Pending),
            "ready" => Ok(NodeState::Ready),
            "running" => Ok(NodeState::Running),
            "succeeded" => Ok(NodeState::Succeeded),
            "failed" => Ok(NodeState::FAILED),
            "retrying" => Ok(NodeState::RETRYING),
            "skipped" => Ok(NodeState::Skipped),
            "cancelled" => Ok(NodeState::Cancelled),
            _ => Err(format!("Unknown node state: {}", s)),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// e.g. `manual`, `cli`
    pub kind: String,

    /// Values for inputs no upstream node binds, keyed by input name
    #[serde(default)]
    pub payload: Value,
}

impl Trigger {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn manual() -> Self {
        Self::new("manual", Value::Null)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Payload value for an input name, if the payload is an object.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|m| m.get(key))
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::manual()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRunState {
    pub node_type: String,

    #[serde(flatten)]
    pub state: NodeState,

    /// Attempts started so far; at most retries + 1
    pub attempt_count: u32,

    pub last_error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,

    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl NodeRunState {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            state: NodeState::Pending,
            attempt_count: 0,
            last_error: None,
            started_at: None,
            ended_at: None,
            outputs: Map::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Immutable view of a run at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub flow_id: String,
    pub flow_version: u32,
    pub flow_name: String,
    pub trigger: Trigger,
    pub state: RunState,
    pub node_states: BTreeMap<String, NodeRunState>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeRunState> {
        self.node_states.get(name)
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.node_states.get(name).map(|n| n.state)
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of nodes currently in `state`.
    pub fn count(&self, state: NodeState) -> usize {
        self.node_states.values().filter(|n| n.state == state).count()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [NodeState; 8] = [
        NodeState::Pending,
        NodeState::Ready,
        NodeState::Running,
        NodeState::Succeeded,
        NodeState::FAILED,
        NodeState::RETRYING,
        NodeState::Skipped,
        NodeState::Cancelled,
    ];

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_retry_path() {
        assert!(NodeState::Running.can_transition_to(NodeState::RETRYING));
        assert!(NodeState::RETRYING.can_transition_to(NodeState::Running));
        assert!(NodeState::RETRYING.can_transition_to(NodeState::Cancelled));
        assert!(!NodeState::RETRYING.can_transition_to(NodeState::Succeeded));
    }

    #[test]
    fn test_skip_only_from_pending() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(NodeState::Skipped),
                from == NodeState::Pending
            );
        }
        assert!(!NodeState::Pending.can_transition_to(NodeState::Running));
    }

    #[test]
    fn test_state_strings_round_trip() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<NodeState>(), Ok(state));
        }
        for state in ["pending", "running", "succeeded", "failed", "cancelled"] {
            assert_eq!(state.parse::<RunState>().unwrap().as_str(), state);
        }
        assert!("done".parse::<RunState>().is_err());
    }

    #[test]
    fn test_node_state_serialization() {
        let mut node = NodeRunState::new("set");
        node.state = NodeState::RETRYING;
        node.attempt_count = 1;
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["retryable"], true);
        assert_eq!(value["node_type"], "set");

        let back: NodeRunState = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_trigger_payload_lookup() {
        let trigger = Trigger::manual().with_payload(json!({"rows": [1, 2]}));
        assert_eq!(trigger.value("rows"), Some(&json!([1, 2])));
        assert_eq!(trigger.value("other"), None);
        assert_eq!(Trigger::default().value("rows"), None);
    }
}
