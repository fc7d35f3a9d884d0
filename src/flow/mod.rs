//! Compiled flows: definitions, dependency graph and the compiler.

mod compiler;
mod dag;
pub mod types;

pub use compiler::{
    compile, compile_source, compile_source_with, select_flow, to_json, Compilation, Compiler,
};
pub use dag::FlowGraph;
pub use types::{
    parse_duration, parse_duration_str, types_compatible, Edge, FlowConfig, FlowDefinition,
    InputSpec, NodeSpec, PortRef, RetryPolicy,
};
