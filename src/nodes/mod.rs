//! Node capabilities.
//!
//! A capability is the behaviour behind a node type name. The compiler checks
//! node declarations against each capability's [`CapabilityDescriptor`]; the
//! engine calls [`Capability::run`] once per attempt. Three generic
//! capabilities ship built in: `set`, `debug` and `wait`.

mod debug;
mod registry;
mod set;
pub mod types;
mod wait;

pub use debug::DebugNode;
pub use registry::CapabilityRegistry;
pub use set::SetNode;
pub use types::{
    Capability, CapabilityDescriptor, LogLevel, NodeContext, NodeOutput, NodeSignal,
    PortDescriptor, SignalSink,
};
pub use wait::WaitNode;
