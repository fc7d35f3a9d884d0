//! Set node - emit configured values.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::types::{Capability, CapabilityDescriptor, NodeContext, NodeOutput};
use crate::error::{Error, Result};

/// Outputs a value built from its configuration.
///
/// `value: x` emits `x` as is. Otherwise every config key becomes a field of
/// an object, with dotted keys (`user.name`) creating nested objects. When an
/// object arrives on `input`, the fields are set on a copy of it.
pub struct SetNode {
    descriptor: CapabilityDescriptor,
}

impl SetNode {
    pub fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("set")
                .describe("Emit configured values")
                .optional_input("input", "any")
                .output("value", "any"),
        }
    }
}

impl Default for SetNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for SetNode {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput> {
        let empty = Map::new();
        let config = match &ctx.config {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(Error::Node(format!(
                    "Invalid set config: expected an object, got {}",
                    other
                )))
            }
        };

        if let Some(value) = config.get("value") {
            return Ok(NodeOutput::single("value", value.clone())
                .with_metadata(json!({ "fields_set": 1 })));
        }

        let mut output = match ctx.input("input") {
            Some(Value::Object(obj)) => obj.clone(),
            _ => Map::new(),
        };

        for (name, value) in config {
            if name.trim().is_empty() {
                return Err(Error::Node("Set node field name cannot be empty".to_string()));
            }
            set_path_value(&mut output, name, value.clone());
        }

        Ok(NodeOutput::single("value", Value::Object(output))
            .with_metadata(json!({ "fields_set": config.len() })))
    }
}

fn set_path_value(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }

        match entry.as_object_mut() {
            Some(map) => current = map,
            None => return,
        }
    }

    current.insert((*last).to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(config: Value) -> NodeContext {
        NodeContext::new("run-1", "flow", "set").with_config(config)
    }

    #[tokio::test]
    async fn test_value_passthrough() {
        let node = SetNode::new();
        let out = node.run(&ctx(json!({"value": [1, 2, 3]}))).await.unwrap();
        assert_eq!(out.get("value"), Some(&json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_fields_with_dotted_paths() {
        let node = SetNode::new();
        let out = node
            .run(&ctx(json!({"user.name": "ada", "user.id": 7, "active": true})))
            .await
            .unwrap();
        assert_eq!(
            out.get("value"),
            Some(&json!({"user": {"name": "ada", "id": 7}, "active": true}))
        );
        assert_eq!(out.metadata["fields_set"], 3);
    }

    #[tokio::test]
    async fn test_merges_into_input_object() {
        let node = SetNode::new();
        let context = ctx(json!({"status": "done"})).with_input("input", json!({"id": 1}));
        let out = node.run(&context).await.unwrap();
        assert_eq!(out.get("value"), Some(&json!({"id": 1, "status": "done"})));
    }

    #[tokio::test]
    async fn test_rejects_non_object_config() {
        let node = SetNode::new();
        assert!(node.run(&ctx(json!("nope"))).await.is_err());
    }

    #[test]
    fn test_set_path_overwrites_scalars() {
        let mut root = Map::new();
        root.insert("a".to_string(), json!(1));
        set_path_value(&mut root, "a.b", json!(2));
        assert_eq!(Value::Object(root), json!({"a": {"b": 2}}));
    }
}
