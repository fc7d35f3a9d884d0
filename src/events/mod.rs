//! Per-run event stream.
//!
//! Every run owns one [`EventBus`]. The scheduler publishes status, metric,
//! log and diagram events; observers subscribe to all of them or to a subset
//! of kinds, optionally replaying recent history first.

mod bus;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use bus::{EventBus, Subscription, SubscriptionError, DEFAULT_HISTORY, DEFAULT_BACKLOG};

/// Logical channel an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Run or node state transition
    Status,
    /// Numeric sample emitted by a node
    Metric,
    /// Log line emitted by a node or the engine
    Log,
    /// Mermaid rendering of the flow with current node states
    Diagram,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Status,
        EventKind::Metric,
        EventKind::Log,
        EventKind::Diagram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Metric => "metric",
            EventKind::Log => "log",
            EventKind::Diagram => "diagram",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(EventKind::Status),
            "metric" | "metrics" => Ok(EventKind::Metric),
            "log" | "logs" => Ok(EventKind::Log),
            "diagram" => Ok(EventKind::Diagram),
            other => Err(format!(
                "unknown event kind '{}' (expected status, metric, log or diagram)",
                other
            )),
        }
    }
}

/// One entry in a run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,

    /// Node the event concerns; `None` for run-level events
    pub node_name: Option<String>,

    pub kind: EventKind,

    pub payload: Value,

    /// Starts at 1, gapless per run
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Wire form: one JSON object per line.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"run_id":"{}","sequence":{},"error":"{}"}}"#,
                self.run_id, self.sequence, e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("status".parse::<EventKind>(), Ok(EventKind::Status));
        assert_eq!(" Metrics ".parse::<EventKind>(), Ok(EventKind::Metric));
        assert_eq!("diagram".parse::<EventKind>(), Ok(EventKind::Diagram));
        assert!("progress".parse::<EventKind>().is_err());
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_wire_form() {
        let event = Event {
            run_id: "run-1".into(),
            node_name: Some("extract".into()),
            kind: EventKind::Metric,
            payload: json!({"name": "rows", "value": 3.0}),
            sequence: 7,
            timestamp: Utc::now(),
        };
        let parsed: Value = serde_json::from_str(&event.to_json_line()).unwrap();
        assert_eq!(parsed["kind"], "metric");
        assert_eq!(parsed["sequence"], 7);
        assert_eq!(parsed["node_name"], "extract");
        assert_eq!(parsed["payload"]["name"], "rows");
        assert!(parsed["timestamp"].is_string());

        let back: Event = serde_json::from_value(parsed).unwrap();
        assert_eq!(back, event);
    }
}
