//! Capability trait and context types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::CancelSignal;
use crate::error::Result;

/// One declared input or output port of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    pub value_type: String,
    #[serde(default)]
    pub required: bool,
}

/// Static description of a node type: its name and its ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub node_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<PortDescriptor>,
    #[serde(default)]
    pub outputs: Vec<PortDescriptor>,
}

impl CapabilityDescriptor {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a required input port.
    pub fn input(mut self, name: impl Into<String>, value_type: impl Into<String>) -> Self {
        self.inputs.push(PortDescriptor {
            name: name.into(),
            value_type: value_type.into(),
            required: true,
        });
        self
    }

    pub fn optional_input(
        mut self,
        name: impl Into<String>,
        value_type: impl Into<String>,
    ) -> Self {
        self.inputs.push(PortDescriptor {
            name: name.into(),
            value_type: value_type.into(),
            required: false,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, value_type: impl Into<String>) -> Self {
        self.outputs.push(PortDescriptor {
            name: name.into(),
            value_type: value_type.into(),
            required: false,
        });
        self
    }

    pub fn find_input(&self, name: &str) -> Option<&PortDescriptor> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn find_output(&self, name: &str) -> Option<&PortDescriptor> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Values a capability produced, keyed by output port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub outputs: Map<String, Value>,
    /// Extra information (timing, counts) that is not routed to other nodes
    pub metadata: Value,
}

impl NodeOutput {
    pub fn new(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            metadata: Value::Null,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// A result with a single output port.
    pub fn single(port: impl Into<String>, value: Value) -> Self {
        Self::empty().with_output(port, value)
    }

    pub fn with_output(mut self, port: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(port.into(), value);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.outputs.get(port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Something a capability reports while it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum NodeSignal {
    Metric {
        name: String,
        value: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

type SinkFn = dyn Fn(NodeSignal) + Send + Sync;

/// Destination for the signals of one node attempt.
#[derive(Clone, Default)]
pub struct SignalSink(Option<Arc<SinkFn>>);

impl SignalSink {
    pub fn new(f: impl Fn(NodeSignal) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self(None)
    }

    pub fn emit(&self, signal: NodeSignal) {
        if let Some(f) = &self.0 {
            f(signal);
        }
    }
}

impl fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignalSink")
            .field(&if self.0.is_some() { "attached" } else { "discard" })
            .finish()
    }
}

/// Context passed to a capability for one attempt.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,

    pub flow_name: String,

    pub node_name: String,

    /// 1-based attempt number
    pub attempt: u32,

    /// Resolved input values, keyed by input port
    pub inputs: Map<String, Value>,

    /// Node configuration from the `config {}` block
    pub config: Value,

    cancel: CancelSignal,

    sink: SignalSink,
}

impl NodeContext {
    pub fn new(run_id: &str, flow_name: &str, node_name: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            flow_name: flow_name.to_string(),
            node_name: node_name.to_string(),
            attempt: 1,
            inputs: Map::new(),
            config: Value::Object(Map::new()),
            cancel: CancelSignal::new(),
            sink: SignalSink::discard(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: SignalSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// A key of the node's config object.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn metric(&self, name: impl Into<String>, value: f64) {
        self.sink.emit(NodeSignal::Metric {
            name: name.into(),
            value,
            unit: None,
        });
    }

    pub fn metric_with_unit(&self, name: impl Into<String>, value: f64, unit: impl Into<String>) {
        self.sink.emit(NodeSignal::Metric {
            name: name.into(),
            value,
            unit: Some(unit.into()),
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.emit(NodeSignal::Log {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
}

/// Behaviour registered under a node type name.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Node type name and ports.
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Run one attempt.
    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput>;

    fn node_type(&self) -> &str {
        &self.descriptor().node_type
    }

    fn description(&self) -> &str {
        &self.descriptor().description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_descriptor_builder() {
        let desc = CapabilityDescriptor::new("csv")
            .describe("Read CSV")
            .input("path", "text")
            .optional_input("delimiter", "text")
            .output("rows", "table");

        assert_eq!(desc.node_type, "csv");
        assert!(desc.find_input("path").unwrap().required);
        assert!(!desc.find_input("delimiter").unwrap().required);
        assert_eq!(desc.find_output("rows").unwrap().value_type, "table");
        assert!(desc.find_output("path").is_none());
    }

    #[test]
    fn test_node_output() {
        let out = NodeOutput::single("value", json!(1)).with_output("extra", json!("x"));
        assert_eq!(out.get("value"), Some(&json!(1)));
        assert_eq!(out.outputs.len(), 2);
        assert!(NodeOutput::empty().outputs.is_empty());
    }

    #[test]
    fn test_context_signals_reach_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            SignalSink::new(move |signal| seen.lock().unwrap().push(signal))
        };
        let ctx = NodeContext::new("run-1", "flow", "node").with_sink(sink);

        ctx.metric("rows", 3.0);
        ctx.metric_with_unit("latency", 1.5, "ms");
        ctx.info("loaded");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2],
            NodeSignal::Log {
                level: LogLevel::Info,
                message: "loaded".to_string()
            }
        );
    }

    #[test]
    fn test_context_defaults() {
        let ctx = NodeContext::new("run-1", "flow", "node")
            .with_input("a", json!(2))
            .with_config(json!({"value": 5}));
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.input("a"), Some(&json!(2)));
        assert_eq!(ctx.setting("value"), Some(&json!(5)));
        assert!(!ctx.is_cancelled());
        // Discarding sink must not panic
        ctx.metric("ignored", 1.0);
    }
}
