//! Retry limiting for failed work items.
//!
//! A failed item first waits out its own exponential backoff, then takes a
//! token from a bucket shared by all items. The bucket bounds the overall
//! retry rate when many items fail at once.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Decides the requeue delay for work items.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again. Counts as one failure.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`; its next failure starts from the minimum delay.
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// `base * 2^attempt`, capped at `max`. Overflow yields `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Per-item exponential backoff: 5ms, 10ms, 20ms, ... up to the cap.
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> ItemExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        calculate_backoff(attempt, self.base, self.max)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by all items.
///
/// Does not track individual items.
pub struct TokenBucket {
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// A bucket refilling at `qps` tokens per second holding at most `burst`.
    pub fn new(qps: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(qps).allow_burst(burst);
        Self {
            limiter: GovernorLimiter::direct(quota),
        }
    }

    /// Wait for a token and take it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Settings for the work queue's retry limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Delay after the first failure of an item.
    pub base_delay: Duration,
    /// Cap on the per-item delay.
    pub max_delay: Duration,
    /// Overall retry rate across all items, per second.
    pub qps: u32,
    /// Overall retry burst across all items.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10,
            burst: 100,
        }
    }
}

impl RateLimitConfig {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the backoff range is inverted or
    /// the overall rate or burst is zero.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay > self.max_delay {
            return Err(Error::invalid_config(format!(
                "base backoff {:?} exceeds max backoff {:?}",
                self.base_delay, self.max_delay
            )));
        }
        self.bucket().map(|_| ())
    }

    /// Per-item backoff with these settings.
    pub fn backoff<T: Eq + Hash + Clone>(&self) -> ItemExponentialBackoff<T> {
        ItemExponentialBackoff::new(self.base_delay, self.max_delay)
    }

    /// Overall bucket with these settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `qps` or `burst` is zero.
    pub fn bucket(&self) -> Result<TokenBucket> {
        let qps = NonZeroU32::new(self.qps)
            .ok_or_else(|| Error::invalid_config("qps must be at least 1"))?;
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| Error::invalid_config("burst must be at least 1"))?;
        Ok(TokenBucket::new(qps, burst))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_calculate_backoff_doubles() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);

        assert_eq!(calculate_backoff(0, base, max), Duration::from_millis(5));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_millis(10));
        assert_eq!(calculate_backoff(4, base, max), Duration::from_millis(80));
    }

    #[test]
    fn test_calculate_backoff_is_capped() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);

        assert_eq!(calculate_backoff(30, base, max), max);
        assert_eq!(calculate_backoff(u32::MAX, base, max), max);
    }

    #[test]
    fn test_item_backoff_tracks_items_independently() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1));

        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(2));
        assert_eq!(limiter.when(&"b"), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }

    #[test]
    fn test_forget_resets_to_base_delay() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));

        for _ in 0..5 {
            limiter.when(&"pod");
        }
        assert_eq!(limiter.when(&"pod"), Duration::from_millis(160));

        limiter.forget(&"pod");

        assert_eq!(limiter.num_requeues(&"pod"), 0);
        assert_eq!(limiter.when(&"pod"), Duration::from_millis(5));
    }

    fn nonzero(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn test_token_bucket_allows_burst_then_refuses() {
        let bucket = TokenBucket::new(nonzero(1), nonzero(2));

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_token_bucket_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(nonzero(20), nonzero(1));
        bucket.acquire().await;

        let started = std::time::Instant::now();
        bucket.acquire().await;

        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RateLimitConfig::default();

        assert!(config.validate().is_ok());
        assert!(config.bucket().is_ok());
    }

    #[test]
    fn test_zero_rate_or_burst_rejected() {
        let zero_qps = RateLimitConfig {
            qps: 0,
            ..RateLimitConfig::default()
        };
        let zero_burst = RateLimitConfig {
            burst: 0,
            ..RateLimitConfig::default()
        };

        assert!(matches!(zero_qps.validate(), Err(Error::InvalidConfig { .. })));
        assert!(matches!(zero_burst.bucket(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_slowest_rate_builds_without_panicking() {
        let config = RateLimitConfig {
            qps: 1,
            burst: 1,
            ..RateLimitConfig::default()
        };

        let bucket = config.bucket().unwrap();

        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let config = RateLimitConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RateLimitConfig::default()
        };

        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }
}
