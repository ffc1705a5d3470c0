//! Flow-control pre-hook (§4.6): obtains the per-service rate limiter and
//! gates admission before any upstream work is attempted.

use crate::config::FlowFilterConfig;
use crate::error::GatewayError;
use crate::ratelimit::RateLimiterRegistry;

/// `None` config means the route carries no `flow` entry — no rate
/// limiting applies. `Some` but `enabled: false` also passes through.
pub async fn check(
    config: Option<&FlowFilterConfig>,
    service_name: &str,
    limiters: &RateLimiterRegistry,
) -> Result<(), GatewayError> {
    let Some(config) = config else {
        return Ok(());
    };
    if !config.enabled {
        return Ok(());
    }
    let limiter = limiters.get_or_create(service_name, config);
    if limiter.try_consume().await {
        Ok(())
    } else {
        Err(GatewayError::TooManyRequests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitAlgorithm;

    fn config(capacity: u64) -> FlowFilterConfig {
        FlowFilterConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::TokenBucket,
            capacity,
            refill_per_second: 0,
            window_millis: 0,
            leak_interval_millis: 0,
        }
    }

    #[tokio::test]
    async fn absent_config_always_admits() {
        let limiters = RateLimiterRegistry::new();
        for _ in 0..10 {
            assert!(check(None, "svc", &limiters).await.is_ok());
        }
    }

    #[tokio::test]
    async fn disabled_config_always_admits() {
        let limiters = RateLimiterRegistry::new();
        let mut cfg = config(1);
        cfg.enabled = false;
        assert!(check(Some(&cfg), "svc", &limiters).await.is_ok());
        assert!(check(Some(&cfg), "svc", &limiters).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_capacity_rejects_with_too_many_requests() {
        let limiters = RateLimiterRegistry::new();
        let cfg = config(1);
        assert!(check(Some(&cfg), "svc", &limiters).await.is_ok());
        let err = check(Some(&cfg), "svc", &limiters).await.unwrap_err();
        assert!(matches!(err, GatewayError::TooManyRequests));
    }
}
