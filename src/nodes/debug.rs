//! Debug node - log and inspect data during flow execution.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::types::{Capability, CapabilityDescriptor, LogLevel, NodeContext, NodeOutput};
use crate::error::{Error, Result};

/// Logs its input and passes it through unchanged on `output`.
pub struct DebugNode {
    descriptor: CapabilityDescriptor,
}

impl DebugNode {
    pub fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("debug")
                .describe("Log and inspect data during flow execution")
                .optional_input("input", "any")
                .output("output", "any"),
        }
    }
}

impl Default for DebugNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum DebugLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

impl From<DebugLevel> for LogLevel {
    fn from(level: DebugLevel) -> Self {
        match level {
            DebugLevel::Debug => LogLevel::Debug,
            DebugLevel::Info => LogLevel::Info,
            DebugLevel::Warn => LogLevel::Warn,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DebugConfig {
    /// Message to log
    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    level: DebugLevel,

    /// Label for this debug point
    #[serde(default)]
    label: Option<String>,

    /// Specific fields to extract and log from input
    #[serde(default)]
    fields: Option<Vec<String>>,
}

#[async_trait]
impl Capability for DebugNode {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput> {
        let config: DebugConfig = match &ctx.config {
            Value::Null => DebugConfig::default(),
            other => serde_json::from_value(other.clone())
                .map_err(|e| Error::Node(format!("Invalid debug config: {}", e)))?,
        };

        let label = config.label.as_deref().unwrap_or(&ctx.node_name);
        let input = ctx.input("input").cloned().unwrap_or(Value::Null);

        if let Some(message) = &config.message {
            log_at(config.level, label, message);
            ctx.log(config.level.into(), format!("[{}] {}", label, message));
        }

        let rendered = match &config.fields {
            Some(fields) => {
                let extracted: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|field| (field.clone(), get_field_value(&input, field)))
                    .collect();
                Value::Object(extracted)
            }
            None => input.clone(),
        };
        let formatted = serde_json::to_string(&rendered).unwrap_or_else(|_| rendered.to_string());
        log_at(config.level, label, &format!("input = {}", formatted));
        ctx.log(config.level.into(), format!("[{}] input = {}", label, formatted));
        ctx.metric_with_unit("input_bytes", formatted.len() as f64, "bytes");

        Ok(NodeOutput::single("output", input).with_metadata(json!({
            "label": label,
            "attempt": ctx.attempt,
        })))
    }
}

/// Get a nested field value from JSON.
fn get_field_value(value: &Value, path: &str) -> Value {
    let mut current = value;
    for part in path.split('.') {
        let next = match current {
            Value::Object(obj) => obj.get(part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|idx| arr.get(idx)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn log_at(level: DebugLevel, label: &str, message: &str) {
    match level {
        DebugLevel::Debug => debug!("[{}] {}", label, message),
        DebugLevel::Info => info!("[{}] {}", label, message),
        DebugLevel::Warn => warn!("[{}] {}", label, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::types::{NodeSignal, SignalSink};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_get_field_value() {
        let value = json!({"user": {"tags": ["a", "b"]}, "count": 2});
        assert_eq!(get_field_value(&value, "count"), json!(2));
        assert_eq!(get_field_value(&value, "user.tags.1"), json!("b"));
        assert_eq!(get_field_value(&value, "user.missing"), Value::Null);
    }

    #[tokio::test]
    async fn test_passes_input_through_and_logs() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            SignalSink::new(move |s| seen.lock().unwrap().push(s))
        };
        let ctx = NodeContext::new("run-1", "flow", "inspect")
            .with_input("input", json!({"rows": 3}))
            .with_config(json!({"message": "checkpoint", "level": "warn"}))
            .with_sink(sink);

        let out = DebugNode::new().run(&ctx).await.unwrap();
        assert_eq!(out.get("output"), Some(&json!({"rows": 3})));
        assert_eq!(out.metadata["label"], "inspect");

        let seen = seen.lock().unwrap();
        let logs: Vec<_> = seen
            .iter()
            .filter_map(|s| match s {
                NodeSignal::Log { level, message } => Some((*level, message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(logs[0], (LogLevel::Warn, "[inspect] checkpoint".to_string()));
        assert!(logs[1].1.contains("\"rows\":3"));
        assert!(seen
            .iter()
            .any(|s| matches!(s, NodeSignal::Metric { name, .. } if name == "input_bytes")));
    }

    #[tokio::test]
    async fn test_without_input_outputs_null() {
        let ctx = NodeContext::new("run-1", "flow", "inspect");
        let out = DebugNode::new().run(&ctx).await.unwrap();
        assert_eq!(out.get("output"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let ctx = NodeContext::new("run-1", "flow", "inspect").with_config(json!({"level": 5}));
        assert!(DebugNode::new().run(&ctx).await.is_err());
    }
}
