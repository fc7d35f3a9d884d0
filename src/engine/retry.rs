//! Retry delay calculation.

use std::time::Duration;

use crate::flow::RetryPolicy;

/// Delay before the attempt after failed attempt number `attempt` (1-based):
/// `backoff * 2^(attempt-1)`, capped at `max_backoff`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    policy
        .backoff
        .saturating_mul(1u32 << shift)
        .min(policy.max_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            retries: 5,
            timeout: None,
            backoff: Duration::from_millis(backoff_ms),
            max_backoff: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy(100, 60_000);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_capped_at_max_backoff() {
        let p = policy(1_000, 3_000);
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(3));
        assert_eq!(backoff_delay(&p, 30), Duration::from_secs(3));
        assert_eq!(backoff_delay(&p, u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_backoff() {
        assert_eq!(backoff_delay(&policy(0, 1_000), 4), Duration::ZERO);
    }
}
