//! Wait/delay node - pause execution for a duration.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::types::{Capability, CapabilityDescriptor, NodeContext, NodeOutput};
use crate::error::{Error, Result};
use crate::flow::types::parse_duration;

/// Longest wait accepted, to catch unit mistakes
const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

/// Sleeps for `duration`, then passes `input` through on `output`.
/// Wakes early with [`Error::Cancelled`] when the run is cancelled.
pub struct WaitNode {
    descriptor: CapabilityDescriptor,
}

impl WaitNode {
    pub fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new("wait")
                .describe("Pause execution for a specified duration")
                .optional_input("input", "any")
                .output("output", "any"),
        }
    }
}

impl Default for WaitNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for WaitNode {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeOutput> {
        let wait = wait_duration(&ctx.config)?;

        if !wait.is_zero() {
            info!(
                "Wait node '{}' pausing for {}ms (run: {})",
                ctx.node_name,
                wait.as_millis(),
                ctx.run_id
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.cancelled() => return Err(Error::Cancelled),
            }
        }

        ctx.metric_with_unit("waited_ms", wait.as_millis() as f64, "ms");

        let input = ctx.input("input").cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::single("output", input).with_metadata(json!({
            "waited_ms": wait.as_millis() as u64,
        })))
    }
}

/// Wait duration from `duration` (seconds or a suffixed string) or
/// `milliseconds`. Absent means no wait.
fn wait_duration(config: &Value) -> Result<Duration> {
    let wait = if let Some(value) = config.get("duration") {
        parse_duration(value).map_err(|e| Error::Node(format!("Invalid wait duration: {}", e)))?
    } else if let Some(value) = config.get("milliseconds") {
        let ms = value
            .as_u64()
            .ok_or_else(|| Error::Node(format!("Invalid wait milliseconds: {}", value)))?;
        Duration::from_millis(ms)
    } else {
        Duration::ZERO
    };

    if wait > MAX_WAIT {
        return Err(Error::Node(format!(
            "Wait duration {}ms exceeds maximum of {}ms (1 hour)",
            wait.as_millis(),
            MAX_WAIT.as_millis()
        )));
    }

    Ok(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CancelSignal;
    use std::time::Instant;

    #[test]
    fn test_wait_duration() {
        assert_eq!(wait_duration(&json!({})).unwrap(), Duration::ZERO);
        assert_eq!(
            wait_duration(&json!({"duration": "250ms"})).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            wait_duration(&json!({"duration": 2})).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            wait_duration(&json!({"milliseconds": 40})).unwrap(),
            Duration::from_millis(40)
        );
        assert!(wait_duration(&json!({"duration": -1})).is_err());
        assert!(wait_duration(&json!({"duration": "2h"})).is_err());
    }

    #[tokio::test]
    async fn test_waits_and_passes_through() {
        let ctx = NodeContext::new("run-1", "flow", "pause")
            .with_config(json!({"duration": "20ms"}))
            .with_input("input", json!("payload"));

        let started = Instant::now();
        let out = WaitNode::new().run(&ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(out.get("output"), Some(&json!("payload")));
        assert_eq!(out.metadata["waited_ms"], 20);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancelSignal::new();
        let ctx = NodeContext::new("run-1", "flow", "pause")
            .with_config(json!({"duration": "10s"}))
            .with_cancel(cancel.clone());

        let handle = tokio::spawn(async move { WaitNode::new().run(&ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait should stop promptly")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
