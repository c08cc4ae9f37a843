//! Per-client token bucket rate limiting

use crate::config::{OverflowMode, RateLimitingConfig};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovRateLimiter,
};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type SharedLimiter = Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limit check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over limit; quarantine the message
    Quarantine,
    /// Over limit; drop silently (still counted)
    Drop,
}

/// Token bucket limiter keyed by client id. The bucket refills `rate_limit`
/// tokens per `window_size` and allows a burst equal to the rate.
pub struct RateLimiter {
    config: RwLock<RateLimitingConfig>,
    clients: DashMap<String, SharedLimiter>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            config: RwLock::new(config.clone()),
            clients: DashMap::new(),
        }
    }

    /// Check one message from `client_id`. Clients are tracked lazily.
    pub fn check(&self, client_id: &str) -> RateDecision {
        let config = self.config.read();
        if !config.enabled || config.rate_limit == 0 {
            return RateDecision::Allowed;
        }

        let limiter = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| create_limiter(&config))
            .clone();

        if limiter.check().is_ok() {
            RateDecision::Allowed
        } else {
            debug!(client_id, "per-client rate limit exceeded");
            match config.mode {
                OverflowMode::Quarantine => RateDecision::Quarantine,
                OverflowMode::Drop => RateDecision::Drop,
            }
        }
    }

    pub fn reconfigure(&self, config: &RateLimitingConfig) {
        *self.config.write() = config.clone();
        // Buckets are recreated on demand under the new quota
        self.clients.clear();
    }

    /// Bound the lazily-grown client map.
    pub fn cleanup(&self) {
        if self.clients.len() > 10_000 {
            self.clients.clear();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn create_limiter(config: &RateLimitingConfig) -> SharedLimiter {
    let rate = NonZeroU32::new(config.rate_limit).unwrap_or(nonzero!(1u32));
    let window = Duration::from_secs(config.window_size_secs.max(1));

    // One token per (window / rate), burst = rate
    let period = window / rate.get();
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(rate))
        .allow_burst(rate);
    Arc::new(GovRateLimiter::direct(quota))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: u32, mode: OverflowMode) -> RateLimitingConfig {
        RateLimitingConfig {
            enabled: true,
            rate_limit: rate,
            window_size_secs: 1,
            mode,
        }
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::new(&RateLimitingConfig::default());
        for _ in 0..1000 {
            assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        }
    }

    #[test]
    fn test_burst_then_quarantine() {
        let limiter = RateLimiter::new(&config(2, OverflowMode::Quarantine));

        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        assert_eq!(limiter.check("client1"), RateDecision::Quarantine);
    }

    #[test]
    fn test_drop_mode() {
        let limiter = RateLimiter::new(&config(1, OverflowMode::Drop));

        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        assert_eq!(limiter.check("client1"), RateDecision::Drop);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(&config(1, OverflowMode::Quarantine));

        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        assert_eq!(limiter.check("client2"), RateDecision::Allowed);
        assert_eq!(limiter.check("client1"), RateDecision::Quarantine);
        assert_eq!(limiter.check("client2"), RateDecision::Quarantine);
    }

    #[test]
    fn test_reconfigure_resets_buckets() {
        let limiter = RateLimiter::new(&config(1, OverflowMode::Quarantine));
        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
        assert_eq!(limiter.check("client1"), RateDecision::Quarantine);

        limiter.reconfigure(&config(5, OverflowMode::Quarantine));
        assert_eq!(limiter.check("client1"), RateDecision::Allowed);
    }
}
