//! Reconnect backoff

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter
///
/// The delay doubles per consecutive failure up to `max`, then gets a random
/// factor within `±jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Default jitter ratio
    pub const DEFAULT_JITTER: f64 = 0.2;

    /// Create a backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: Self::DEFAULT_JITTER,
            attempt: 0,
        }
    }

    /// Override the jitter ratio (0 disables jitter)
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, without jitter
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt, advancing the failure count
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }

    /// Back to the base delay after a successful handshake
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures counted so far
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_capped() {
        let mut backoff =
            Backoff::new(Duration::from_secs(3), Duration::from_secs(20)).with_jitter(0.0);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 20, 20]);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff =
            Backoff::new(Duration::from_secs(3), Duration::from_secs(60)).with_jitter(0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(10));
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(8), "{delay:?} below bound");
            assert!(delay <= Duration::from_secs(12), "{delay:?} above bound");
        }
    }
}
