//! Execution engine: run state, scheduling, retries and cancellation.

mod cancel;
mod diagram;
mod retry;
pub mod run;
mod scheduler;
mod stats;

pub use cancel::CancelSignal;
pub use diagram::render_mermaid;
pub use retry::backoff_delay;
pub use run::{NodeRunState, NodeState, RunSnapshot, RunState, Trigger};
pub use scheduler::{RunHandle, RunPolicy, Scheduler, SchedulerOptions};
pub use stats::{EngineStats, EngineStatsSnapshot};
