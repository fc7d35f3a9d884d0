//! Cooperative cancellation for runs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cancellation flag shared by a run's driver and every capability it runs.
///
/// Capabilities either poll [`is_cancelled`](Self::is_cancelled) or race
/// their work against [`cancelled`](Self::cancelled). Ones that do neither
/// are aborted once the run's grace period expires.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
}

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;
const CLOSED: u8 = 2;

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` only for the first request, and
    /// only while the signal has not been [closed](Self::close).
    pub fn cancel(&self) -> bool {
        let accepted = self
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if accepted {
            self.notify.notify_waiters();
        }
        accepted
    }

    /// Refuse any later cancel request. Returns `false` if a request already
    /// got in first.
    pub fn close(&self) -> bool {
        match self
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == CLOSED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// Resolves once cancellation has been requested, immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_close_refuses_later_cancel() {
        let signal = CancelSignal::new();
        assert!(signal.close());
        assert!(signal.close());
        assert!(!signal.cancel());
        assert!(!signal.is_cancelled());

        let signal = CancelSignal::new();
        assert!(signal.cancel());
        assert!(!signal.close());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_set() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("should not block");
    }
}
