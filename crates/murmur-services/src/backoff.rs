//! Reconnect delay policy.
//!
//! With `base == max` this is the fixed-interval retry of the reference
//! behaviour. With `max > base` the delay doubles after every consecutive
//! failure up to `max`, and resets once a connection comes online.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
