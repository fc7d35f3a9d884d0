//! Ordered, replayable fan-out of one run's events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Event, EventKind};

/// Events kept for late subscribers.
pub const DEFAULT_HISTORY: usize = 1024;

/// Unread events a subscriber may hold before it is disconnected.
pub const DEFAULT_BACKLOG: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber fell behind and missed {missed} events")]
    Overflow { missed: u64 },

    #[error("cannot replay from sequence {requested}: oldest retained event is {oldest}")]
    ReplayUnavailable { requested: u64, oldest: u64 },
}

/// Per-run event bus. Cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    run_id: String,
    history_capacity: usize,
    /// One clone per live subscription
    subscribers: Arc<()>,
    state: Mutex<BusState>,
}

struct BusState {
    next_sequence: u64,
    history: VecDeque<Event>,
    /// `None` once closed
    tx: Option<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>, history_capacity: usize, subscriber_backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_backlog.max(1));
        Self {
            inner: Arc::new(BusInner {
                run_id: run_id.into(),
                history_capacity,
                subscribers: Arc::new(()),
                state: Mutex::new(BusState {
                    next_sequence: 1,
                    history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY)),
                    tx: Some(tx),
                }),
            }),
        }
    }

    pub fn with_defaults(run_id: impl Into<String>) -> Self {
        Self::new(run_id, DEFAULT_HISTORY, DEFAULT_BACKLOG)
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Append an event and deliver it to current subscribers. Never blocks on
    /// slow consumers.
    pub fn publish(&self, node_name: Option<&str>, kind: EventKind, payload: Value) -> Event {
        let mut state = self.state();

        let event = Event {
            run_id: self.inner.run_id.clone(),
            node_name: node_name.map(str::to_string),
            kind,
            payload,
            sequence: state.next_sequence,
            timestamp: Utc::now(),
        };
        state.next_sequence += 1;

        if self.inner.history_capacity > 0 {
            if state.history.len() == self.inner.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        match &state.tx {
            // A send error only means nobody is listening right now
            Some(tx) => {
                let _ = tx.send(event.clone());
            }
            None => warn!(
                run_id = %self.inner.run_id,
                sequence = event.sequence,
                "Event published after bus was closed"
            ),
        }

        event
    }

    /// Live events from the next published one onward.
    pub fn subscribe(&self) -> Subscription {
        let state = self.state();
        Subscription::new(
            VecDeque::new(),
            state.tx.as_ref().map(|tx| tx.subscribe()),
            state.next_sequence,
            self.inner.subscribers.clone(),
        )
    }

    /// Live events of the given kinds only.
    pub fn subscribe_kinds(&self, kinds: &[EventKind]) -> Subscription {
        let mut subscription = self.subscribe();
        subscription.kinds = Some(kinds.to_vec());
        subscription
    }

    /// Replay retained events with `sequence >= from`, then continue live.
    pub fn subscribe_from(&self, from: u64) -> Result<Subscription, SubscriptionError> {
        let state = self.state();
        let from = from.max(1);
        let oldest = state
            .history
            .front()
            .map(|e| e.sequence)
            .unwrap_or(state.next_sequence);

        if from < oldest {
            return Err(SubscriptionError::ReplayUnavailable {
                requested: from,
                oldest,
            });
        }

        let replay: VecDeque<Event> = state
            .history
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect();
        debug!(
            run_id = %self.inner.run_id,
            from,
            replayed = replay.len(),
            "Subscriber replaying history"
        );

        // Subscribed under the same lock as the history snapshot, so the live
        // receiver starts exactly where the replay ends.
        Ok(Subscription::new(
            replay,
            state.tx.as_ref().map(|tx| tx.subscribe()),
            from,
            self.inner.subscribers.clone(),
        ))
    }

    /// End the stream. Subscribers drain what they have, then see `None`.
    pub fn close(&self) {
        let mut state = self.state();
        if state.tx.take().is_some() {
            debug!(
                run_id = %self.inner.run_id,
                last_sequence = state.next_sequence - 1,
                "Event bus closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().tx.is_none()
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.state().history.iter().cloned().collect()
    }

    /// Sequence of the most recent event, 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.state().next_sequence - 1
    }

    /// Subscriptions not yet dropped, whether or not the bus is closed.
    pub fn subscriber_count(&self) -> usize {
        Arc::strong_count(&self.inner.subscribers) - 1
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("run_id", &self.inner.run_id)
            .field("last_sequence", &self.last_sequence())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A cursor into a run's event stream. Dropping it detaches from the bus.
pub struct Subscription {
    replay: VecDeque<Event>,
    rx: Option<broadcast::Receiver<Event>>,
    next_expected: u64,
    kinds: Option<Vec<EventKind>>,
    _token: Arc<()>,
}

impl Subscription {
    fn new(
        replay: VecDeque<Event>,
        rx: Option<broadcast::Receiver<Event>>,
        next_expected: u64,
        token: Arc<()>,
    ) -> Self {
        Self {
            replay,
            rx,
            next_expected,
            kinds: None,
            _token: token,
        }
    }

    /// Restrict delivery to the given kinds.
    pub fn only(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }

    /// Next event in sequence order.
    ///
    /// `Ok(None)` once the bus is closed and everything delivered. An
    /// [`Overflow`](SubscriptionError::Overflow) is reported once, after
    /// which the subscription is disconnected and yields `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Event>, SubscriptionError> {
        while let Some(event) = self.replay.pop_front() {
            self.next_expected = event.sequence + 1;
            if self.accepts(event.kind) {
                return Ok(Some(event));
            }
        }

        loop {
            let Some(rx) = self.rx.as_mut() else {
                return Ok(None);
            };

            match rx.recv().await {
                Ok(event) => {
                    if event.sequence < self.next_expected {
                        continue;
                    }
                    self.next_expected = event.sequence + 1;
                    if self.accepts(event.kind) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.rx = None;
                    return Err(SubscriptionError::Overflow { missed });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Receive until the stream ends, stopping early on overflow.
    pub async fn collect(mut self) -> Result<Vec<Event>, SubscriptionError> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await? {
            events.push(event);
        }
        Ok(events)
    }

    pub fn is_connected(&self) -> bool {
        self.rx.is_some() || !self.replay.is_empty()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pending_replay", &self.replay.len())
            .field("next_expected", &self.next_expected)
            .field("kinds", &self.kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sequences(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_sequences_start_at_one() {
        let bus = EventBus::with_defaults("run-1");
        assert_eq!(bus.last_sequence(), 0);
        let first = bus.publish(None, EventKind::Status, json!({"state": "running"}));
        let second = bus.publish(Some("a"), EventKind::Log, json!({"message": "hi"}));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.node_name.as_deref(), Some("a"));
        assert_eq!(second.run_id, "run-1");
        assert_eq!(bus.last_sequence(), 2);
    }

    #[tokio::test]
    async fn test_live_subscribers_see_same_order() {
        let bus = EventBus::with_defaults("run-1");
        let one = bus.subscribe();
        let two = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        for i in 0..5 {
            bus.publish(None, EventKind::Metric, json!({"i": i}));
        }
        bus.close();

        let one = one.collect().await.unwrap();
        let two = two.collect().await.unwrap();
        assert_eq!(sequences(&one), vec![1, 2, 3, 4, 5]);
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_subscribe_sees_only_new_events() {
        let bus = EventBus::with_defaults("run-1");
        bus.publish(None, EventKind::Status, json!({}));
        let sub = bus.subscribe();
        bus.publish(None, EventKind::Status, json!({}));
        bus.close();
        assert_eq!(sequences(&sub.collect().await.unwrap()), vec![2]);
    }

    #[tokio::test]
    async fn test_replay_then_live_without_gaps() {
        let bus = EventBus::with_defaults("run-1");
        for _ in 0..3 {
            bus.publish(None, EventKind::Status, json!({}));
        }
        let mut sub = bus.subscribe_from(2).unwrap();
        bus.publish(None, EventKind::Status, json!({}));
        bus.close();

        let mut seen = Vec::new();
        while let Some(event) = sub.recv().await.unwrap() {
            seen.push(event.sequence);
        }
        assert_eq!(seen, vec![2, 3, 4]);
        // Stays ended
        assert_eq!(sub.recv().await, Ok(None));
    }

    #[test]
    fn test_replay_older_than_history() {
        let bus = EventBus::new("run-1", 3, 16);
        for _ in 0..5 {
            bus.publish(None, EventKind::Status, json!({}));
        }
        assert_eq!(sequences(&bus.history()), vec![3, 4, 5]);

        let err = bus.subscribe_from(2).unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::ReplayUnavailable {
                requested: 2,
                oldest: 3
            }
        );
        assert!(bus.subscribe_from(3).is_ok());
        assert!(bus.subscribe_from(9).is_ok());
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::with_defaults("run-1");
        let sub = bus.subscribe_kinds(&[EventKind::Log, EventKind::Diagram]);
        bus.publish(None, EventKind::Status, json!({}));
        bus.publish(Some("a"), EventKind::Log, json!({"message": "x"}));
        bus.publish(Some("a"), EventKind::Metric, json!({}));
        bus.publish(None, EventKind::Diagram, json!({"mermaid": "flowchart TD"}));
        bus.close();

        let events = sub.collect().await.unwrap();
        assert_eq!(sequences(&events), vec![2, 4]);
        assert_eq!(events[0].kind, EventKind::Log);
    }

    #[tokio::test]
    async fn test_slow_subscriber_overflows_without_blocking_producer() {
        let bus = EventBus::new("run-1", 64, 4);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    bus.publish(None, EventKind::Metric, json!({"i": i}));
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer must not block")
            .unwrap();

        assert_eq!(slow.recv().await, Err(SubscriptionError::Overflow { missed: 6 }));
        assert_eq!(slow.recv().await, Ok(None));
        assert!(!slow.is_connected());
        drop(slow);

        // Overflow never trims the retained history
        let replay = bus.subscribe_from(1).unwrap();
        bus.close();
        assert_eq!(replay.collect().await.unwrap().len(), 10);
        assert!(matches!(fast.recv().await, Err(SubscriptionError::Overflow { .. })));
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let bus = EventBus::with_defaults("run-1");
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let late = bus.subscribe_from(1).unwrap();
        bus.close();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        drop(late);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_replays_only() {
        let bus = EventBus::with_defaults("run-1");
        bus.publish(None, EventKind::Status, json!({}));
        bus.publish(None, EventKind::Status, json!({}));
        bus.close();

        let events = bus.subscribe_from(1).unwrap().collect().await.unwrap();
        assert_eq!(sequences(&events), vec![1, 2]);
        let mut live = bus.subscribe();
        assert_eq!(live.recv().await, Ok(None));
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let bus = EventBus::with_defaults("run-1");
        let mut sub = bus.subscribe();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(Some("n"), EventKind::Log, json!({"message": "late"}));
        });
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event.payload["message"], "late");
    }
}
