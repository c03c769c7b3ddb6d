//! Exponential backoff for transient deploy failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt ceiling; reaching it moves the job to `dead`.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Delay before a job that found its device busy is claimable again.
    pub busy_requeue_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            busy_requeue_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` (1-based) failed:
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn busy_delay(&self) -> Duration {
        Duration::from_millis(self.busy_requeue_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            busy_requeue_ms: 50,
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_millis(1_000));
        assert_eq!(p.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_zero_base_never_waits() {
        let p = RetryPolicy {
            base_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(p.delay(3), Duration::ZERO);
    }
}
