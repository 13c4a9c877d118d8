//! Bounded randomized backoff between unsuccessful claim attempts.
//!
//! Every delay is drawn uniformly from `[min, max]`. The delay does not grow
//! with consecutive failures: contention is bounded by the worker count, and
//! the randomness keeps many workers from polling the store in lockstep.

use std::time::Duration;

use rand::RngExt;

use crate::config::BackoffConfig;
use crate::error::ConfigError;

/// Uniform random delay source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a backoff over `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidBackoff` if `min > max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        BackoffConfig::new(min, max).validate()?;
        Ok(Self { min, max })
    }

    /// Creates a backoff from validated configuration.
    pub fn from_config(config: &BackoffConfig) -> Result<Self, ConfigError> {
        Self::new(config.min, config.max)
    }

    /// Draws the next delay.
    pub fn next_delay(&self) -> Duration {
        let min = duration_nanos(self.min);
        let max = duration_nanos(self.max);
        if min == max {
            return self.min;
        }
        let nanos = rand::rng().random_range(min..=max);
        Duration::from_nanos(nanos)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_delay_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(900))
            .expect("valid bounds");

        for _ in 0..1000 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100), "delay {:?} below min", delay);
            assert!(delay <= Duration::from_millis(900), "delay {:?} above max", delay);
        }
    }

    #[test]
    fn test_delay_is_random() {
        let backoff =
            Backoff::new(Duration::ZERO, Duration::from_secs(5)).expect("valid bounds");

        let distinct: HashSet<Duration> = (0..200).map(|_| backoff.next_delay()).collect();

        // A fixed period would yield a single value.
        assert!(distinct.len() > 100, "only {} distinct delays", distinct.len());
    }

    #[test]
    fn test_degenerate_range() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_millis(250))
            .expect("valid bounds");

        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let result = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigError::InvalidBackoff { .. })));
    }

    #[test]
    fn test_from_config() {
        let backoff = Backoff::from_config(&BackoffConfig::default()).expect("defaults valid");
        assert_eq!(backoff.min(), Duration::ZERO);
        assert_eq!(backoff.max(), Duration::from_secs(5));
    }
}
