//! # Exponential Backoff
//!
//! Per-key retry delays for the work queue and re-list delays for the
//! reflector. The delay doubles with every consecutive failure and is capped,
//! so a key that keeps failing settles at the cap instead of growing without
//! bound.
//!
//! Default sequence (5ms base, 1000s cap): 5ms, 10ms, 20ms, 40ms, ... 1000s (max).

use std::time::Duration;

/// Exponential backoff calculator
///
/// Stateless: the caller keeps the failure count (the work queue keeps one
/// per key) and asks for the delay belonging to that count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay for the first failure
    base: Duration,
    /// Upper bound for any delay
    cap: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    ///
    /// # Arguments
    ///
    /// * `base` - Delay returned for a failure count of 0
    /// * `cap` - Maximum delay
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for the first failure
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Maximum delay
    #[must_use]
    pub const fn cap(&self) -> Duration {
        self.cap
    }

    /// Calculate the delay for a given number of previous failures
    ///
    /// Returns `base * 2^failures`, capped at `cap`. Saturates at the cap
    /// instead of overflowing for large failure counts.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let Some(factor) = 2u32.checked_pow(failures) else {
            return self.cap;
        };
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));

        // 10ms, 20ms, 40ms, 80ms, 160ms, 320ms, 640ms, 1s (max)
        assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(80));
        assert_eq!(backoff.delay_for(6), Duration::from_millis(640));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let backoff = ExponentialBackoff::default();

        assert_eq!(backoff.delay_for(0), Duration::from_millis(5));
        // 5ms * 2^18 = 1310.72s, over the cap
        assert_eq!(backoff.delay_for(18), Duration::from_secs(1000));
        // Would overflow u32 / Duration without saturation
        assert_eq!(backoff.delay_for(40), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[test]
    fn test_exponential_backoff_is_monotonic() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(3), Duration::from_secs(7));
        let delays: Vec<Duration> = (0..64).map(|n| backoff.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays.last().copied(), Some(Duration::from_secs(7)));
    }
}
