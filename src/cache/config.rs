//! Coordinator tuning.

use std::time::Duration;

const DEFAULT_WAITER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Timing knobs for the single-flight coordinator.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on how long a waiter blocks before giving up.
    pub waiter_timeout: Duration,
    /// First poll delay of the waiter backoff.
    pub backoff_initial: Duration,
    /// Ceiling the backoff doubles up to.
    pub backoff_max: Duration,
    /// Age after which an unanswered record may be reclaimed by a new owner.
    pub owner_lease: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            waiter_timeout: DEFAULT_WAITER_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            owner_lease: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            waiter_timeout: settings.waiter_timeout,
            backoff_initial: settings.waiter_backoff_initial,
            backoff_max: settings.waiter_backoff_max,
            owner_lease: settings.owner_lease,
        }
    }
}

impl CacheConfig {
    /// Next poll delay after `current`, doubled and clamped to the ceiling.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_ceiling() {
        let config = CacheConfig {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            ..CacheConfig::default()
        };

        let second = config.next_backoff(config.backoff_initial);
        let third = config.next_backoff(second);
        let fourth = config.next_backoff(third);

        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(350));
        assert_eq!(fourth, Duration::from_millis(350));
    }

    #[test]
    fn lease_is_disabled_by_default() {
        assert!(CacheConfig::default().owner_lease.is_none());
    }
}
