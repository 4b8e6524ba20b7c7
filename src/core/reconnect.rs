use std::time::Duration;

/// Capped exponential backoff for automatic reconnects.
///
/// Attempt `k` (1-based) waits `min(base * 2^(k-1), max)`. Once `max_attempts`
/// delays have been handed out, [`next_delay`](Self::next_delay) returns `None`
/// until [`reset`](Self::reset) is called after a successful open.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay for the 1-based attempt number, without touching the counter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = 1u32
            .checked_shl(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max);
        scaled.min(self.max)
    }

    /// Consume one attempt from the budget and return its delay.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }
}
