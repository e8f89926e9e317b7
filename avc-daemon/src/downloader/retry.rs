//! Backoff between download attempts.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive attempts without progress before giving up.
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubled for each further one.
    pub base_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base = self.base_delay.as_millis().min(u128::from(u64::MAX)) as f64;

        // Attempts are small; cap the exponent so the shift cannot overflow.
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = base * f64::from(1u32 << exponent);

        let jitter = delay * self.jitter_factor * (rand::random::<f64>() * 2.0 - 1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (delay + jitter).max(0.0).round() as u64;

        Duration::from_millis(millis)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
