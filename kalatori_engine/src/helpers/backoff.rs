use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, used when reconnecting to chain endpoints and when re-submitting withdrawals.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial, failures: 0 }
    }

    /// The number of consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before the next attempt. Up to 10% of random jitter is added so
    /// that several watchers that lost the same node do not reconnect in lock-step.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (delay.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        delay + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}
