use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff with jitter. Never gives up; the ceiling only caps the
/// delay between attempts.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_delay,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.policy.initial_delay;
    }

    /// Next delay, drawn uniformly from `[current / 2, current]`.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let ceiling = self.current.min(self.policy.max_delay);
        self.current = (self.current * 2).min(self.policy.max_delay);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let floor_ms = ceiling_ms / 2;
        Duration::from_millis(rand::thread_rng().gen_range(floor_ms..=ceiling_ms))
    }
}
