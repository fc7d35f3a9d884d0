//! Capability registry - maps node type names to their behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Capability, CapabilityDescriptor, NodeContext, NodeOutput};
use super::{DebugNode, SetNode, WaitNode};
use crate::error::{Error, Result};

/// Registry of available node types.
#[derive(Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create a new registry with the built-in capabilities.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(SetNode::new()));
        registry.register(Arc::new(DebugNode::new()));
        registry.register(Arc::new(WaitNode::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability under its node type. Replaces any previous
    /// registration of the same type.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.node_type().to_string(), capability);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(node_type).cloned()
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.capabilities.contains_key(node_type)
    }

    pub fn descriptor(&self, node_type: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.get(node_type).map(|c| c.descriptor())
    }

    /// Run one attempt of a capability by type.
    pub async fn run(&self, node_type: &str, ctx: &NodeContext) -> Result<NodeOutput> {
        let capability = self
            .get(node_type)
            .ok_or_else(|| Error::Node(format!("Unknown node type: {}", node_type)))?;

        capability.run(ctx).await
    }

    /// Registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// `(node_type, description)` pairs, sorted by type.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .capabilities
            .iter()
            .map(|(name, c)| (name.as_str(), c.description()))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("types", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoNode {
        descriptor: CapabilityDescriptor,
    }

    #[async_trait]
    impl Capability for EchoNode {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput> {
            Ok(NodeOutput::single(
                "out",
                ctx.input("in").cloned().unwrap_or_default(),
            ))
        }
    }

    #[test]
    fn test_registry_default_capabilities() {
        let registry = CapabilityRegistry::new();
        assert_eq!(registry.list(), vec!["debug", "set", "wait"]);
        assert!(registry.has("set"));
        assert!(!registry.has("http"));
        assert_eq!(
            registry.descriptor("wait").unwrap().outputs[0].name,
            "output"
        );
    }

    #[test]
    fn test_empty_registry() {
        let registry = CapabilityRegistry::empty();
        assert!(registry.list().is_empty());
        assert!(registry.get("set").is_none());
    }

    #[tokio::test]
    async fn test_register_and_run_custom() {
        let registry = CapabilityRegistry::empty().with(Arc::new(EchoNode {
            descriptor: CapabilityDescriptor::new("echo")
                .describe("Echo")
                .input("in", "any")
                .output("out", "any"),
        }));
        assert_eq!(registry.descriptions(), vec![("echo", "Echo")]);

        let ctx = NodeContext::new("run-1", "flow", "e").with_input("in", json!(42));
        let out = registry.run("echo", &ctx).await.unwrap();
        assert_eq!(out.get("out"), Some(&json!(42)));

        let err = registry.run("missing", &ctx).await.unwrap_err();
        assert_eq!(err.code(), "NODE_ERROR");
    }
}
