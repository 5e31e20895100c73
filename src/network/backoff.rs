//! Reconnect backoff

use std::time::Duration;

use crate::config::SessionTimings;

/// Delays stop growing after this many doublings
const MAX_DOUBLINGS: u32 = 16;

/// Exponential backoff, `initial * 2^(attempt-1)` capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial.min(self.max);
        }
        let exp = (attempt - 1).min(MAX_DOUBLINGS);
        let scaled = self.initial.as_millis().saturating_mul(1u128 << exp);
        Duration::from_millis(scaled.min(self.max.as_millis()) as u64)
    }

    /// Sum of all delays across `max_attempts`, saturating
    pub fn total_delay(&self) -> Duration {
        let growing = self.max_attempts.min(MAX_DOUBLINGS + 1);
        let total = (1..=growing).fold(Duration::ZERO, |acc, n| acc.saturating_add(self.delay_for(n)));
        let flat = self.max_attempts - growing;
        total.saturating_add(self.delay_for(growing + 1).saturating_mul(flat))
    }

    /// Whole reconnect budget when each attempt may take `per_attempt`
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        per_attempt
            .saturating_mul(self.max_attempts)
            .saturating_add(self.total_delay())
    }
}

impl From<&SessionTimings> for ReconnectPolicy {
    fn from(timings: &SessionTimings) -> Self {
        Self {
            max_attempts: timings.reconnect_attempts.max(1),
            initial: Duration::from_millis(timings.reconnect_initial_ms),
            max: Duration::from_millis(timings.reconnect_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            initial: Duration::from_millis(500),
            max: Duration::from_millis(3000),
        }
    }

    #[test]
    fn test_doubling_with_cap() {
        let policy = policy();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        assert_eq!(policy.total_delay(), Duration::from_millis(9500));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        assert_eq!(policy().delay_for(u32::MAX), Duration::from_millis(3000));
    }

    #[test]
    fn test_total_delay_past_growth() {
        let policy = ReconnectPolicy {
            max_attempts: 20,
            initial: Duration::from_millis(1),
            max: Duration::from_secs(3600),
        };
        let summed: Duration = (1..=20).map(|n| policy.delay_for(n)).sum();
        assert_eq!(policy.total_delay(), summed);
    }

    #[test]
    fn test_budget_saturates() {
        let unbounded = ReconnectPolicy {
            max_attempts: u32::MAX,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(
            unbounded.total_delay(),
            Duration::from_secs(60) * 11 + Duration::from_secs(1 + 2 + 4 + 8 + 16 + 32)
                + Duration::from_secs(60).saturating_mul(u32::MAX - 17)
        );
        assert_eq!(unbounded.budget(Duration::from_secs(u64::MAX)), Duration::MAX);

        let short = ReconnectPolicy {
            max_attempts: 3,
            ..policy()
        };
        assert_eq!(
            short.budget(Duration::from_secs(1)),
            Duration::from_secs(3) + Duration::from_millis(500 + 1000 + 2000)
        );
    }

    #[test]
    fn test_from_timings() {
        let policy = ReconnectPolicy::from(&SessionTimings::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial, Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_millis(8000));
    }
}
