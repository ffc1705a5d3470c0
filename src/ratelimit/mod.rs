//! Flow-control rate limiters (C1) for the flow filter (§4.6).

pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::config::{FlowFilterConfig, RateLimitAlgorithm};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One of the three admission algorithms, selected per-service by
/// `FlowFilterConfig.algorithm`.
pub enum RateLimiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
    LeakyBucket(Arc<LeakyBucket>),
}

impl RateLimiter {
    pub fn new(config: &FlowFilterConfig) -> Self {
        match config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                RateLimiter::TokenBucket(TokenBucket::new(config.capacity, config.refill_per_second))
            }
            RateLimitAlgorithm::SlidingWindow => {
                RateLimiter::SlidingWindow(SlidingWindow::new(config.capacity, config.window_millis))
            }
            RateLimitAlgorithm::LeakyBucket => {
                RateLimiter::LeakyBucket(LeakyBucket::new(config.capacity, config.leak_interval_millis))
            }
        }
    }

    /// Admission check. Token bucket and sliding window resolve
    /// synchronously (non-suspending); leaky bucket suspends until the leak
    /// task dequeues this caller.
    pub async fn try_consume(&self) -> bool {
        match self {
            RateLimiter::TokenBucket(b) => b.try_consume(),
            RateLimiter::SlidingWindow(w) => w.try_consume(),
            RateLimiter::LeakyBucket(q) => q.try_consume().await,
        }
    }
}

/// Per-service limiter cache (§4.6, §5): populated under atomic
/// compute-if-absent, invalidated by a route-change listener registered at
/// most once per service.
///
/// When `instance_count` is set (distributed mode, §10.2 — wired from the
/// etcd-lease instance registry), each built limiter's capacity and refill
/// rate are divided by the current live peer count, so the *cluster-wide*
/// admission rate approximates the configured value regardless of how many
/// gateway replicas are running.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
    listened: DashMap<String, ()>,
    instance_count: Option<Arc<AtomicU32>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_count(instance_count: Arc<AtomicU32>) -> Self {
        Self {
            instance_count: Some(instance_count),
            ..Self::default()
        }
    }

    pub fn get_or_create(&self, service_name: &str, config: &FlowFilterConfig) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(service_name) {
            return existing.clone();
        }
        let config = self.scaled(config);
        self.limiters
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(&config)))
            .clone()
    }

    fn scaled(&self, config: &FlowFilterConfig) -> FlowFilterConfig {
        let Some(ref instance_count) = self.instance_count else {
            return config.clone();
        };
        let peers = instance_count.load(Ordering::Acquire).max(1) as u64;
        FlowFilterConfig {
            capacity: (config.capacity / peers).max(1),
            refill_per_second: config.refill_per_second / peers,
            ..config.clone()
        }
    }

    /// Invalidates the memoized limiter for a service; the next request
    /// rebuilds it from the current config.
    pub fn invalidate(&self, service_name: &str) {
        self.limiters.remove(service_name);
    }

    pub fn has_listener(&self, service_name: &str) -> bool {
        self.listened.contains_key(service_name)
    }

    pub fn mark_listener_registered(&self, service_name: &str) {
        self.listened.insert(service_name.to_string(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bucket_config(capacity: u64, refill: u64) -> FlowFilterConfig {
        FlowFilterConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::TokenBucket,
            capacity,
            refill_per_second: refill,
            window_millis: 0,
            leak_interval_millis: 0,
        }
    }

    #[tokio::test]
    async fn registry_memoizes_per_service() {
        let registry = RateLimiterRegistry::new();
        let cfg = token_bucket_config(5, 0);
        let a = registry.get_or_create("svc-a", &cfg);
        let b = registry.get_or_create("svc-a", &cfg);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let registry = RateLimiterRegistry::new();
        let cfg = token_bucket_config(5, 0);
        let a = registry.get_or_create("svc-a", &cfg);
        registry.invalidate("svc-a");
        let b = registry.get_or_create("svc-a", &cfg);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn listener_registration_is_tracked_once() {
        let registry = RateLimiterRegistry::new();
        assert!(!registry.has_listener("svc-a"));
        registry.mark_listener_registered("svc-a");
        assert!(registry.has_listener("svc-a"));
    }
}
