//! Per-scheduler execution counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::run::RunState;

/// Counters owned by one [`Scheduler`](super::Scheduler). Unlike the
/// process-wide `metrics` facade these are always recorded and are scoped to
/// the scheduler that ran the work.
#[derive(Debug, Default)]
pub struct EngineStats {
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    node_attempts: AtomicU64,
    node_retries: AtomicU64,
    node_timeouts: AtomicU64,
    events_published: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub node_attempts: u64,
    pub node_retries: u64,
    pub node_timeouts: u64,
    pub events_published: u64,
    pub store_failures: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn run_finished(&self, state: RunState) {
        let counter = match state {
            RunState::Succeeded => &self.runs_succeeded,
            RunState::Failed => &self.runs_failed,
            RunState::Cancelled => &self.runs_cancelled,
            RunState::Pending | RunState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attempt(&self) {
        self.node_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry(&self) {
        self.node_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self) {
        self.node_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            node_attempts: self.node_attempts.load(Ordering::Relaxed),
            node_retries: self.node_retries.load(Ordering::Relaxed),
            node_timeouts: self.node_timeouts.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
