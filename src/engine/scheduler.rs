//! Run scheduling.
//!
//! Each run gets one driver task that owns the run's state and makes every
//! state decision, and one task per dispatched node that loops over attempts.
//! Node tasks report to the driver over an unbounded channel; the driver
//! publishes a status event for every transition before acting on it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::cancel::CancelSignal;
use super::diagram::render_mermaid;
use super::retry::backoff_delay;
use super::run::{NodeRunState, NodeState, RunSnapshot, RunState, Trigger};
use super::stats::{EngineStats, EngineStatsSnapshot};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, Subscription, DEFAULT_BACKLOG, DEFAULT_HISTORY};
use crate::flow::{
    compile_source_with, select_flow, Compiler, FlowConfig, FlowDefinition, FlowGraph, NodeSpec,
    RetryPolicy,
};
use crate::metrics;
use crate::nodes::{Capability, CapabilityRegistry, NodeContext, NodeOutput, NodeSignal, SignalSink};
use crate::storage::RunStore;

/// How node outcomes roll up into the run's final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    /// Any node in final failure fails the run
    #[default]
    FailOnAnyFailure,
    /// The run succeeds if at least one node succeeded
    AllowPartialSuccess,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Time running capabilities get to stop after a cancel before they are
    /// aborted
    pub grace_period: Duration,
    pub history_capacity: usize,
    pub subscriber_backlog: usize,
    pub run_policy: RunPolicy,
    /// Settings for flows whose `config {}` block leaves them out
    pub flow_defaults: FlowConfig,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            history_capacity: DEFAULT_HISTORY,
            subscriber_backlog: DEFAULT_BACKLOG,
            run_policy: RunPolicy::default(),
            flow_defaults: FlowConfig::default(),
        }
    }
}

/// Starts runs and keeps track of them.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<CapabilityRegistry>,
    options: SchedulerOptions,
    store: Option<Arc<dyn RunStore>>,
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
    stats: Arc<EngineStats>,
}

impl Scheduler {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            options: SchedulerOptions::default(),
            store: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(EngineStats::new()),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Persist every terminal run snapshot to `store`.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run of `definition`. Must be called from within a Tokio
    /// runtime. Finished runs nobody is subscribed to are forgotten first.
    pub fn start(&self, definition: Arc<FlowDefinition>, trigger: Trigger) -> Result<RunHandle> {
        self.check(&definition)?;
        self.prune_finished();

        let run_id = uuid::Uuid::new_v4().to_string();
        let snapshot = RunSnapshot {
            run_id: run_id.clone(),
            flow_id: definition.id.clone(),
            flow_version: definition.version,
            flow_name: definition.name.clone(),
            trigger,
            state: RunState::Pending,
            node_states: definition
                .nodes
                .iter()
                .map(|n| (n.name.clone(), NodeRunState::new(&n.node_type)))
                .collect(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        };

        let bus = EventBus::new(
            &run_id,
            self.options.history_capacity,
            self.options.subscriber_backlog,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let (done_tx, done_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelSignal::new();

        let handle = RunHandle {
            run_id: run_id.clone(),
            snapshot: snapshot_rx,
            done: done_rx,
            bus: bus.clone(),
            cancel: cancel.clone(),
        };

        let driver = Driver {
            graph: definition.graph(),
            remaining: definition.graph().in_degrees(),
            definition: definition.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            stats: self.stats.clone(),
            run_policy: self.options.run_policy,
            grace_period: self.options.grace_period,
            bus,
            cancel,
            snapshot,
            snapshot_tx,
            done_tx,
            tasks: JoinSet::new(),
            tx,
            rx,
        };

        self.stats.run_started();
        self.runs().insert(run_id.clone(), handle.clone());
        info!(
            run_id = %run_id,
            flow = %definition.name,
            version = definition.version,
            nodes = definition.nodes.len(),
            "Starting run"
        );
        tokio::spawn(driver.run());

        Ok(handle)
    }

    /// Compile `source` and start the named flow (the first one if `flow` is
    /// `None`). Any error diagnostic rejects the source.
    pub fn start_source(
        &self,
        source: &str,
        flow: Option<&str>,
        trigger: Trigger,
    ) -> Result<RunHandle> {
        let compiler =
            Compiler::new(&self.registry).with_defaults(self.options.flow_defaults.clone());
        let flows = compile_source_with(&compiler, source)
            .map_err(|diagnostics| Error::Validation(diagnostics.to_string()))?;
        let definition = select_flow(flows, flow)?;
        self.start(Arc::new(definition), trigger)
    }

    /// Definitions can be deserialized or built by hand, so the compiler's
    /// guarantees are checked again here.
    fn check(&self, definition: &FlowDefinition) -> Result<()> {
        for node in &definition.nodes {
            if !self.registry.has(&node.node_type) {
                return Err(Error::Validation(format!(
                    "Node '{}' has unknown type '{}'",
                    node.name, node.node_type
                )));
            }
        }

        let graph = definition.graph();
        if graph.len() != definition.nodes.len() {
            return Err(Error::Validation(format!(
                "Flow '{}' has duplicate node names",
                definition.name
            )));
        }
        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::Validation(format!(
                "Flow '{}' has a dependency cycle: {}",
                definition.name,
                cycle.join(" -> ")
            )));
        }
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.runs().get(run_id).cloned()
    }

    /// Cancel a run by id. `Ok(false)` if it had already finished or was
    /// already cancelled.
    pub fn cancel(&self, run_id: &str) -> Result<bool> {
        self.get(run_id)
            .map(|handle| handle.cancel())
            .ok_or_else(|| Error::Execution(format!("Run not found: {}", run_id)))
    }

    /// Snapshots of every tracked run, oldest first.
    pub fn list_runs(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self.runs().values().map(|h| h.snapshot()).collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub fn active_runs(&self) -> usize {
        self.runs().values().filter(|h| !h.is_finished()).count()
    }

    /// Forget finished runs nobody is subscribed to. Returns how many were
    /// dropped.
    pub fn prune_finished(&self) -> usize {
        let mut runs = self.runs();
        let before = runs.len();
        runs.retain(|_, handle| !handle.is_finished() || handle.bus.subscriber_count() > 0);
        let pruned = before - runs.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished runs");
        }
        pruned
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

/// Caller's view of a run.
#[derive(Clone)]
pub struct RunHandle {
    run_id: String,
    snapshot: watch::Receiver<RunSnapshot>,
    done: watch::Receiver<bool>,
    bus: EventBus,
    cancel: CancelSignal,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.run_id
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The run's events from the first retained one onward.
    pub fn events(&self) -> Subscription {
        match self.bus.subscribe_from(1) {
            Ok(subscription) => subscription,
            Err(e) => {
                debug!(run_id = %self.run_id, error = %e, "Early events trimmed; replaying what is left");
                let oldest = self.bus.history().first().map(|e| e.sequence).unwrap_or(1);
                self.bus
                    .subscribe_from(oldest)
                    .unwrap_or_else(|_| self.bus.subscribe())
            }
        }
    }

    /// Request cancellation. Idempotent. `true` means the run will end
    /// `Cancelled`; `false` means it was already cancelled or its outcome
    /// was already decided.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// True once the final snapshot is published and persisted.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the run to finish and return its final snapshot.
    pub async fn wait(&self) -> RunSnapshot {
        let mut done = self.done.clone();
        // Err means the driver is gone; the last snapshot is all there is
        let _ = done.wait_for(|finished| *finished).await;
        self.snapshot()
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

enum NodeMessage {
    AttemptStarted {
        node: String,
        attempt: u32,
    },
    AttemptFailed {
        node: String,
        attempt: u32,
        error: String,
        retry_in: Duration,
    },
    Signal {
        node: String,
        signal: NodeSignal,
    },
    Finished {
        node: String,
        outcome: NodeOutcome,
    },
}

enum NodeOutcome {
    Succeeded(Map<String, Value>),
    Failed { attempt: u32, error: String },
    Cancelled,
}

struct Driver {
    definition: Arc<FlowDefinition>,
    registry: Arc<CapabilityRegistry>,
    store: Option<Arc<dyn RunStore>>,
    stats: Arc<EngineStats>,
    run_policy: RunPolicy,
    grace_period: Duration,
    bus: EventBus,
    cancel: CancelSignal,
    /// Live state; readers only ever see clones sent through `snapshot_tx`
    snapshot: RunSnapshot,
    snapshot_tx: watch::Sender<RunSnapshot>,
    done_tx: watch::Sender<bool>,
    graph: FlowGraph,
    /// Upstream nodes each node is still waiting on
    remaining: HashMap<String, usize>,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<NodeMessage>,
    rx: mpsc::UnboundedReceiver<NodeMessage>,
}

impl Driver {
    #[instrument(
        name = "flow.run",
        skip(self),
        fields(run_id = %self.snapshot.run_id, flow = %self.definition.name)
    )]
    async fn run(mut self) {
        let started = Instant::now();
        metrics::inc_active_runs();

        self.set_run_state(RunState::Running, None);
        self.publish_diagram();

        let roots: Vec<String> = self.graph.roots().into_iter().map(str::to_string).collect();
        for name in roots {
            if self.transition(&name, NodeState::Ready, Map::new()) {
                self.dispatch(&name);
            }
        }

        let cancel = self.cancel.clone();
        let mut cancelled = false;
        while !self.all_nodes_terminal() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(message) = self.rx.recv() => self.handle(message),
            }
        }

        // From here on the outcome is decided; a cancel that got in before
        // this point still wins.
        let cancelled = cancelled || !self.cancel.close();
        if cancelled {
            self.cancel_remaining().await;
        } else {
            while self.tasks.join_next().await.is_some() {}
        }

        self.finish(started, cancelled).await;
    }

    fn handle(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::AttemptStarted { node, attempt } => {
                self.stats.attempt();
                if let Some(state) = self.snapshot.node_states.get_mut(&node) {
                    state.attempt_count = attempt;
                    state.started_at.get_or_insert_with(Utc::now);
                }
                self.transition(&node, NodeState::Running, Map::new());
            }
            NodeMessage::AttemptFailed {
                node,
                attempt,
                error,
                retry_in,
            } => {
                self.stats.retry();
                if let Some(state) = self.snapshot.node_states.get_mut(&node) {
                    state.last_error = Some(error.clone());
                }
                let mut detail = Map::new();
                detail.insert("attempt".into(), json!(attempt));
                detail.insert("error".into(), json!(error));
                detail.insert("retry_in_ms".into(), json!(retry_in.as_millis() as u64));
                self.transition(&node, NodeState::RETRYING, detail);
            }
            NodeMessage::Signal { node, signal } => self.relay(&node, signal),
            NodeMessage::Finished { node, outcome } => self.complete(&node, outcome),
        }
    }

    fn complete(&mut self, node: &str, outcome: NodeOutcome) {
        let mut detail = Map::new();
        let next = match outcome {
            NodeOutcome::Succeeded(outputs) => {
                if let Some(state) = self.snapshot.node_states.get_mut(node) {
                    state.outputs = outputs;
                }
                NodeState::Succeeded
            }
            NodeOutcome::Failed { attempt, error } => {
                if let Some(state) = self.snapshot.node_states.get_mut(node) {
                    state.last_error = Some(error.clone());
                }
                detail.insert("attempt".into(), json!(attempt));
                detail.insert("error".into(), json!(error));
                NodeState::FAILED
            }
            NodeOutcome::Cancelled => NodeState::Cancelled,
        };

        if self.transition(node, next, detail) {
            self.release_dependents(node);
        }
    }

    /// Decrement the wait count of everything downstream of a finished node.
    /// Nodes whose upstreams all succeeded are dispatched; the rest are
    /// skipped, which in turn releases their own dependents.
    fn release_dependents(&mut self, finished: &str) {
        let mut work = vec![finished.to_string()];

        while let Some(done) = work.pop() {
            let dependents: Vec<String> = self
                .graph
                .dependents(&done)
                .into_iter()
                .map(str::to_string)
                .collect();

            for dependent in dependents {
                let Some(left) = self.remaining.get_mut(&dependent) else {
                    continue;
                };
                *left = left.saturating_sub(1);
                if *left > 0 {
                    continue;
                }

                let blocker = self
                    .graph
                    .upstreams(&dependent)
                    .into_iter()
                    .find(|up| self.snapshot.node_state(up) != Some(NodeState::Succeeded))
                    .map(str::to_string);

                match blocker {
                    None => {
                        if self.transition(&dependent, NodeState::Ready, Map::new()) {
                            self.dispatch(&dependent);
                        }
                    }
                    Some(upstream) => {
                        let mut detail = Map::new();
                        detail.insert(
                            "reason".into(),
                            json!(format!("upstream '{}' did not succeed", upstream)),
                        );
                        if self.transition(&dependent, NodeState::Skipped, detail) {
                            work.push(dependent);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, name: &str) {
        let definition = self.definition.clone();
        let Some(spec) = definition.node(name) else {
            return;
        };

        let Some(capability) = self.registry.get(&spec.node_type) else {
            // Types are checked before the run starts
            error!(node = name, node_type = %spec.node_type, "Capability disappeared from registry");
            self.transition(name, NodeState::Running, Map::new());
            self.complete(
                name,
                NodeOutcome::Failed {
                    attempt: 0,
                    error: format!("Unknown node type: {}", spec.node_type),
                },
            );
            return;
        };

        let sink = {
            let tx = self.tx.clone();
            let node = name.to_string();
            SignalSink::new(move |signal| {
                let _ = tx.send(NodeMessage::Signal {
                    node: node.clone(),
                    signal,
                });
            })
        };

        let ctx = NodeContext::new(&self.snapshot.run_id, &definition.name, name)
            .with_inputs(self.resolve_inputs(spec))
            .with_config(spec.config.clone())
            .with_cancel(self.cancel.clone())
            .with_sink(sink);

        let span = info_span!(
            "node.execute",
            run_id = %self.snapshot.run_id,
            node = %name,
            node_type = %spec.node_type,
        );
        let task = NodeTask {
            node: name.to_string(),
            node_type: spec.node_type.clone(),
            capability,
            ctx,
            policy: spec.policy,
            cancel: self.cancel.clone(),
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        };
        self.tasks.spawn(task.run().instrument(span));
    }

    /// Bound inputs read the producer's output; unbound ones fall back to the
    /// trigger payload key of the same name.
    fn resolve_inputs(&self, spec: &NodeSpec) -> Map<String, Value> {
        let mut inputs = Map::new();

        for (name, input) in &spec.inputs {
            let value = match &input.source {
                Some(source) => match self
                    .snapshot
                    .node(&source.node)
                    .and_then(|producer| producer.outputs.get(&source.port))
                {
                    Some(value) => value.clone(),
                    None => {
                        warn!(
                            node = %spec.name,
                            input = %name,
                            source = %source,
                            "Producer did not emit the bound output; passing null"
                        );
                        Value::Null
                    }
                },
                None => match self.snapshot.trigger.value(name) {
                    Some(value) => value.clone(),
                    None => continue,
                },
            };
            inputs.insert(name.clone(), value);
        }

        inputs
    }

    fn relay(&mut self, node: &str, signal: NodeSignal) {
        let (kind, payload) = match signal {
            NodeSignal::Metric { name, value, unit } => (
                EventKind::Metric,
                json!({ "name": name, "value": value, "unit": unit }),
            ),
            NodeSignal::Log { level, message } => (
                EventKind::Log,
                json!({ "level": level, "message": message, "source": "node" }),
            ),
        };
        self.publish(Some(node), kind, payload);
    }

    /// Apply a node transition if the state machine allows it. Emits the
    /// status event (and a diagram for terminal states) before returning.
    fn transition(&mut self, node: &str, next: NodeState, mut detail: Map<String, Value>) -> bool {
        let (from, attempt, duration_ms) = {
            let Some(state) = self.snapshot.node_states.get_mut(node) else {
                return false;
            };
            if !state.state.can_transition_to(next) {
                debug!(node, from = %state.state, to = %next, "Ignoring node transition");
                return false;
            }
            let from = state.state;
            state.state = next;
            if next.is_terminal() {
                state.ended_at = Some(Utc::now());
            }
            (from, state.attempt_count, state.duration_ms())
        };

        debug!(node, from = %from, to = %next, attempt, "Node transition");

        detail.insert("scope".into(), json!("node"));
        detail.insert("state".into(), json!(next.as_str()));
        detail.insert("previous".into(), json!(from.as_str()));
        detail.entry("attempt").or_insert_with(|| json!(attempt));
        if let NodeState::Failed { retryable } = next {
            detail.insert("retryable".into(), json!(retryable));
        }
        if let Some(ms) = duration_ms {
            detail.insert("duration_ms".into(), json!(ms));
        }

        self.publish(Some(node), EventKind::Status, Value::Object(detail));
        self.sync();
        if next.is_terminal() {
            self.publish_diagram();
        }
        true
    }

    fn set_run_state(&mut self, state: RunState, error: Option<String>) {
        self.snapshot.state = state;
        if state.is_terminal() {
            self.snapshot.ended_at = Some(Utc::now());
        }
        self.snapshot.error = error.clone();

        self.publish(
            None,
            EventKind::Status,
            json!({
                "scope": "run",
                "state": state.as_str(),
                "flow": self.definition.name,
                "error": error,
            }),
        );
        self.sync();
    }

    fn publish_diagram(&mut self) {
        let diagram = render_mermaid(&self.definition, Some(&self.snapshot));
        self.publish(
            None,
            EventKind::Diagram,
            json!({ "format": "mermaid", "diagram": diagram }),
        );
    }

    fn publish(&mut self, node: Option<&str>, kind: EventKind, payload: Value) {
        self.bus.publish(node, kind, payload);
        self.stats.event();
        metrics::record_event(kind.as_str());
    }

    fn sync(&self) {
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }

    fn all_nodes_terminal(&self) -> bool {
        self.snapshot
            .node_states
            .values()
            .all(|n| n.state.is_terminal())
    }

    /// Every unfinished node becomes Cancelled at once. Running tasks get the
    /// grace period to return, after which they are aborted; anything they
    /// report other than metrics and logs is ignored.
    async fn cancel_remaining(&mut self) {
        info!("Cancelling run");

        let names: Vec<String> = self.definition.node_names().map(str::to_string).collect();
        for name in &names {
            if self
                .snapshot
                .node_state(name)
                .is_some_and(|state| !state.is_terminal())
            {
                let mut detail = Map::new();
                detail.insert("reason".into(), json!("run cancelled"));
                self.transition(name, NodeState::Cancelled, detail);
            }
        }

        let grace = tokio::time::sleep(self.grace_period);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                biased;
                Some(message) = self.rx.recv() => self.handle_late(message),
                joined = self.tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = &mut grace => {
                    warn!(
                        tasks = self.tasks.len(),
                        grace_ms = self.grace_period.as_millis() as u64,
                        "Grace period elapsed, aborting node tasks"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        while let Ok(message) = self.rx.try_recv() {
            self.handle_late(message);
        }
    }

    fn handle_late(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::Signal { node, signal } => self.relay(&node, signal),
            NodeMessage::Finished { node, .. } => {
                debug!(node = %node, "Node finished after cancellation")
            }
            NodeMessage::AttemptStarted { .. } | NodeMessage::AttemptFailed { .. } => {}
        }
    }

    fn outcome(&self) -> (RunState, Option<String>) {
        let failed: Vec<&str> = self
            .definition
            .node_names()
            .filter(|name| self.snapshot.node_state(name) == Some(NodeState::FAILED))
            .collect();

        let Some(first) = failed.first() else {
            return (RunState::Succeeded, None);
        };

        let reason = self
            .snapshot
            .node(first)
            .and_then(|n| n.last_error.as_deref())
            .unwrap_or("failed");
        let mut error = format!("Node '{}' failed: {}", first, reason);
        if failed.len() > 1 {
            error.push_str(&format!(" (and {} more)", failed.len() - 1));
        }

        let any_succeeded = self.snapshot.count(NodeState::Succeeded) > 0;
        match self.run_policy {
            RunPolicy::AllowPartialSuccess if any_succeeded => {
                warn!(failed = failed.len(), "Run succeeded partially: {}", error);
                (RunState::Succeeded, None)
            }
            _ => (RunState::Failed, Some(error)),
        }
    }

    async fn finish(mut self, started: Instant, cancelled: bool) {
        let (state, error) = if cancelled {
            (RunState::Cancelled, Some("Run cancelled".to_string()))
        } else {
            self.outcome()
        };

        self.set_run_state(state, error.clone());
        self.publish_diagram();

        let elapsed = started.elapsed();
        match &error {
            Some(error) if state == RunState::Failed => {
                warn!(duration_ms = elapsed.as_millis() as u64, error = %error, "Run failed")
            }
            _ => info!(
                state = %state,
                duration_ms = elapsed.as_millis() as u64,
                "Run finished"
            ),
        }

        metrics::record_run(state.as_str());
        metrics::record_run_duration(elapsed, &self.definition.name);
        metrics::dec_active_runs();
        self.stats.run_finished(state);

        self.persist().await;
        self.bus.close();
        let _ = self.done_tx.send(true);
    }

    /// Store failures are infrastructure problems: they never change the
    /// run's outcome.
    async fn persist(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        if let Err(e) = store.save_run(&self.snapshot).await {
            error!(error = %e, code = e.code(), "Failed to persist run");
            self.stats.store_failure();
            self.publish(
                None,
                EventKind::Log,
                json!({
                    "level": "error",
                    "message": format!("Failed to persist run: {}", e),
                    "source": "infrastructure",
                }),
            );
        }
    }
}

// ============================================================================
// Node task
// ============================================================================

struct NodeTask {
    node: String,
    node_type: String,
    capability: Arc<dyn Capability>,
    ctx: NodeContext,
    policy: RetryPolicy,
    cancel: CancelSignal,
    tx: mpsc::UnboundedSender<NodeMessage>,
    stats: Arc<EngineStats>,
}

impl NodeTask {
    fn send(&self, message: NodeMessage) {
        // The driver outlives every node task it spawns
        let _ = self.tx.send(message);
    }

    fn finish(&self, outcome: NodeOutcome) {
        self.send(NodeMessage::Finished {
            node: self.node.clone(),
            outcome,
        });
    }

    async fn run(self) {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1u32;

        loop {
            if self.cancel.is_cancelled() {
                self.finish(NodeOutcome::Cancelled);
                return;
            }

            self.send(NodeMessage::AttemptStarted {
                node: self.node.clone(),
                attempt,
            });

            let ctx = self.ctx.clone().with_attempt(attempt);
            let started = Instant::now();
            let result = run_attempt(self.capability.as_ref(), &ctx, self.policy.timeout).await;
            metrics::record_node_duration(started.elapsed(), &self.node_type);

            let error = match result {
                Ok(output) => {
                    metrics::record_node_attempt(&self.node_type, "succeeded");
                    debug!(attempt, "Node succeeded");
                    self.finish(NodeOutcome::Succeeded(output.outputs));
                    return;
                }
                Err(Error::Cancelled) if self.cancel.is_cancelled() => {
                    metrics::record_node_attempt(&self.node_type, "cancelled");
                    self.finish(NodeOutcome::Cancelled);
                    return;
                }
                Err(e) => {
                    let status = if matches!(e, Error::Timeout(_)) {
                        self.stats.timeout();
                        "timeout"
                    } else {
                        "failed"
                    };
                    metrics::record_node_attempt(&self.node_type, status);
                    e.to_string()
                }
            };

            if attempt >= max_attempts {
                warn!(attempt, max_attempts, error = %error, "Node failed");
                self.finish(NodeOutcome::Failed { attempt, error });
                return;
            }

            let delay = backoff_delay(&self.policy, attempt);
            warn!(
                "Node '{}' attempt {}/{} failed: {}. Retrying in {}ms",
                self.node,
                attempt,
                max_attempts,
                error,
                delay.as_millis()
            );
            self.send(NodeMessage::AttemptFailed {
                node: self.node.clone(),
                attempt,
                error,
                retry_in: delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.finish(NodeOutcome::Cancelled);
                    return;
                }
            }
            attempt += 1;
        }
    }
}

/// One attempt with the node's timeout as watchdog. A panicking capability
/// fails the attempt instead of taking the task down.
async fn run_attempt(
    capability: &dyn Capability,
    ctx: &NodeContext,
    limit: Option<Duration>,
) -> Result<NodeOutput> {
    let attempt = AssertUnwindSafe(capability.run(ctx)).catch_unwind();

    let outcome = match limit {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => attempt.await,
    };

    outcome.unwrap_or_else(|panic| {
        Err(Error::Node(format!(
            "Capability panicked: {}",
            panic_message(panic.as_ref())
        )))
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
