//! flowline - declarative flow language and DAG execution engine
//!
//! Flows are written in a small block language, compiled against a registry
//! of node capabilities into an immutable [`FlowDefinition`], and executed by
//! a [`Scheduler`] that runs independent nodes concurrently, retries failed
//! attempts with exponential backoff, and publishes every state change on a
//! per-run [`EventBus`].
//!
//! ## Example
//!
//! ```text
//! flow "report" {
//!   config { retries: 2, timeout: "30s" }
//!
//!   node "load" {
//!     type: set
//!     config { value: [3, 1, 2] }
//!   }
//!
//!   node "show" {
//!     type: debug
//!     inputs { input: any from "load.value" }
//!   }
//! }
//! ```
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowline::{CapabilityRegistry, Scheduler, Trigger};
//!
//! # async fn demo(source: &str) -> flowline::Result<()> {
//! let scheduler = Scheduler::new(Arc::new(CapabilityRegistry::new()));
//! let handle = scheduler.start_source(source, None, Trigger::manual())?;
//! let mut events = handle.events();
//! while let Some(event) = events.recv().await? {
//!     println!("{}", event.to_json_line());
//! }
//! let snapshot = handle.wait().await;
//! println!("{}", snapshot.state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod metrics;
pub mod nodes;
pub mod storage;
pub mod telemetry;

pub use engine::{
    CancelSignal, NodeState, RunHandle, RunPolicy, RunSnapshot, RunState, Scheduler,
    SchedulerOptions, Trigger,
};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use flow::{compile_source, Compiler, FlowDefinition};
pub use nodes::{Capability, CapabilityDescriptor, CapabilityRegistry, NodeContext, NodeOutput};
