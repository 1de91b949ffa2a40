use rand::Rng;
use std::time::Duration;

/// Doubling poll interval: grows on empty polls and errors, resets on data.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            jitter: false,
        }
    }

    /// Spreads each delay by up to ±10% so a fleet does not poll in lockstep.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait before the next poll.
    pub fn delay(&self) -> Duration {
        if !self.jitter || self.current.is_zero() {
            return self.current;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        self.current.mul_f64(factor)
    }

    pub fn grow(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
