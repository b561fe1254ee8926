use std::time::Duration;

use crate::config::ReconnectSettings;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Outcome of asking the policy what to do after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Bounded exponential backoff over consecutive connection failures.
///
/// The counter only moves forward through [`ReconnectPolicy::next_attempt`] and
/// only returns to zero through [`ReconnectPolicy::reset`], which the service calls
/// when a transport opens or when a caller explicitly asks to connect again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn next_attempt(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay_for(self.attempts),
        }
    }

    /// Delay before retry number `attempt`: `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Saturate instead of overflowing for large attempt counts; the cap wins anyway.
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_delays(policy: &mut ReconnectPolicy) -> Vec<u64> {
        let mut delays = Vec::new();
        while let ReconnectDecision::Retry { delay, .. } = policy.next_attempt() {
            delays.push(delay.as_millis() as u64);
        }
        delays
    }

    #[test]
    fn default_schedule_doubles_then_caps() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(
            retry_delays(&mut policy),
            vec![2_000, 4_000, 8_000, 16_000, 30_000]
        );
    }

    #[test]
    fn exhausted_after_budget_and_stays_exhausted() {
        let mut policy = ReconnectPolicy::default();
        for expected in 1..=5 {
            match policy.next_attempt() {
                ReconnectDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!(
            policy.next_attempt(),
            ReconnectDecision::Exhausted { attempts: 5 }
        );
        assert_eq!(
            policy.next_attempt(),
            ReconnectDecision::Exhausted { attempts: 5 }
        );
    }

    #[test]
    fn reset_restarts_schedule_from_first_delay() {
        let mut policy = ReconnectPolicy::default();
        policy.next_attempt();
        policy.next_attempt();
        policy.reset();

        assert_eq!(policy.attempts(), 0);
        assert_eq!(
            policy.next_attempt(),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn cap_applies_past_the_budget() {
        let policy = ReconnectPolicy::new(10, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn zero_budget_gives_up_immediately() {
        let mut policy = ReconnectPolicy::new(0, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        assert_eq!(
            policy.next_attempt(),
            ReconnectDecision::Exhausted { attempts: 0 }
        );
    }
}
