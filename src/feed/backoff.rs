use std::time::Duration;

/// Capped exponential backoff for feed reconnects: `base * 2^(n-1)` for the
/// n-th consecutive failure, never above `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    attempt: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let pow = self.attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(base_ms.saturating_mul(1u64 << pow).min(max_ms))
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
