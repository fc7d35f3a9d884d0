//! Executable flow definitions produced by the compiler.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dag::FlowGraph;

/// A validated, executable flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Stable identity; the flow name unless a store assigned one
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub config: FlowConfig,

    /// Nodes in declaration order
    pub nodes: Vec<NodeSpec>,

    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

impl FlowDefinition {
    /// Attach the identity a store assigned to this flow.
    pub fn with_identity(mut self, id: impl Into<String>, version: u32) -> Self {
        self.id = id.into();
        self.version = version;
        self
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Dependency graph over the node names.
    pub fn graph(&self) -> FlowGraph {
        FlowGraph::new(
            self.node_names(),
            self.edges.iter().map(|e| (e.from.as_str(), e.to.as_str())),
        )
    }
}

/// Flow-wide execution settings from the `config {}` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub retries: u32,

    #[serde(default, with = "duration_opt_ms")]
    pub timeout: Option<Duration>,

    #[serde(default = "default_backoff", with = "duration_ms")]
    pub backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration_ms")]
    pub max_backoff: Duration,
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: None,
            backoff: default_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl FlowConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            timeout: self.timeout,
            backoff: self.backoff,
            max_backoff: self.max_backoff,
        }
    }
}

/// Effective retry and timeout policy of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,

    #[serde(default, with = "duration_opt_ms")]
    pub timeout: Option<Duration>,

    #[serde(with = "duration_ms")]
    pub backoff: Duration,

    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        FlowConfig::default().policy()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,

    pub node_type: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,

    /// Output port name to value type
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Capability configuration (a JSON object)
    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub depends_on: Vec<String>,

    pub policy: RetryPolicy,
}

impl NodeSpec {
    /// Names of the nodes this one reads data from or waits for.
    pub fn upstream_nodes(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .values()
            .filter_map(|i| i.source.as_ref().map(|s| s.node.as_str()))
            .chain(self.depends_on.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub value_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PortRef>,
}

/// Reference to a port on another node, written `"node.port"` in source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    /// Parse `"node.port"`. The port is everything after the last dot, so node
    /// names may themselves contain dots.
    pub fn parse(reference: &str) -> Option<Self> {
        let (node, port) = reference.rsplit_once('.')?;
        if node.is_empty() || port.is_empty() {
            return None;
        }
        Some(Self {
            node: node.to_string(),
            port: port.to_string(),
        })
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Graph edge. Data edges carry port names; `depends_on` edges do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl Edge {
    pub fn data(from: &PortRef, to: &str, input: &str) -> Self {
        Self {
            from: from.node.clone(),
            output: Some(from.port.clone()),
            to: to.to_string(),
            input: Some(input.to_string()),
        }
    }

    pub fn control(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            output: None,
            to: to.to_string(),
            input: None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.output.is_some()
    }
}

/// Port types are free-form names; `any` is compatible with everything.
pub fn types_compatible(a: &str, b: &str) -> bool {
    a == b || a == "any" || b == "any"
}

/// Parse a duration value: a number of seconds (fractions allowed) or a string
/// with a `ms`, `s`, `m` or `h` suffix.
pub fn parse_duration(value: &Value) -> Result<Duration, String> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| format!("invalid duration {}", n))?;
            seconds(secs)
        }
        Value::String(s) => parse_duration_str(s),
        other => Err(format!("expected a duration, found {}", other)),
    }
}

pub fn parse_duration_str(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (number, unit_ms) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1_000.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3_600_000.0)
    } else {
        (text, 1_000.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;
    seconds(value * unit_ms / 1_000.0)
}

/// Longest duration accepted; it still fits the millisecond fields used on
/// the wire and in the store.
const MAX_DURATION_SECS: f64 = (u64::MAX / 1_000) as f64;

fn seconds(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("duration must be a non-negative number, got {}", secs));
    }
    if secs > MAX_DURATION_SECS {
        return Err(format!("duration of {} seconds is too large", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {}: {}", secs, e))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_opt_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(&json!(2)), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration(&json!(0.25)), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(&json!("500ms")), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration(&json!("30s")), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration(&json!("2m")), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration(&json!("1h")), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration(&json!("1.5s")), Ok(Duration::from_millis(1500)));
        assert!(parse_duration(&json!(-1)).is_err());
        assert!(parse_duration(&json!("soon")).is_err());
        assert!(parse_duration(&json!(true)).is_err());
    }

    #[test]
    fn test_parse_duration_rejects_huge_values() {
        assert!(parse_duration(&json!(99999999999999999999999999.0)).is_err());
        assert!(parse_duration(&json!("1e30s")).is_err());
        assert!(parse_duration(&json!("1e300h")).is_err());
        assert!(parse_duration(&json!(86_400 * 365)).is_ok());
    }

    #[test]
    fn test_port_ref() {
        let r = PortRef::parse("extract.rows").unwrap();
        assert_eq!(r.node, "extract");
        assert_eq!(r.port, "rows");
        assert_eq!(r.to_string(), "extract.rows");

        let dotted = PortRef::parse("stage.one.rows").unwrap();
        assert_eq!(dotted.node, "stage.one");

        assert!(PortRef::parse("rows").is_none());
        assert!(PortRef::parse(".rows").is_none());
        assert!(PortRef::parse("extract.").is_none());
    }

    #[test]
    fn test_types_compatible() {
        assert!(types_compatible("table", "table"));
        assert!(types_compatible("any", "table"));
        assert!(types_compatible("table", "any"));
        assert!(!types_compatible("table", "text"));
    }

    #[test]
    fn test_policy_serializes_millis() {
        let policy = RetryPolicy {
            retries: 2,
            timeout: Some(Duration::from_secs(5)),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["timeout"], 5000);
        assert_eq!(json["backoff"], 100);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
        assert_eq!(back.max_attempts(), 3);
    }
}
