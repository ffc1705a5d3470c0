//! Resilience composer (C9, §4.10): wraps the upstream call with an ordered
//! decorator stack — retry, fallback, circuit breaker, bulkhead,
//! thread-pool bulkhead — built fresh per service from `ResilienceConfig`,
//! then memoized until the next route change invalidates it.

mod thread_pool;

pub use thread_pool::ThreadPoolBulkhead;

use crate::config::{BulkheadConfig, ResilienceConfig, ResiliencePolicy, ThreadPoolBulkheadConfig};
use crate::error::GatewayError;
use crate::upstream::client::UpstreamResponse;
use crate::upstream::circuit_breaker::CircuitBreakerRegistry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// A retryable async operation. `Arc`'d (not `Box`'d) so every decorator
/// layer can call it more than once without consuming it.
pub type Supplier = Arc<dyn Fn() -> BoxFuture<'static, Result<UpstreamResponse, GatewayError>> + Send + Sync>;

/// Per-service resilience primitives: the circuit-breaker registry (shared,
/// already service-keyed internally), a shared bounded retry scheduler, and
/// per-service bulkhead/thread-pool state. Memoized the same way as the
/// rate-limiter and filter-chain caches (§5): populated under atomic
/// compute-if-absent, invalidated by a route-change listener.
pub struct ResiliencePrimitives {
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Caps how many requests may be concurrently sleeping between retry
    /// attempts, modeling the spec's "shared retry scheduler (cap ≈ 10
    /// threads)" without actually spawning OS threads.
    retry_scheduler: Arc<Semaphore>,
    bulkheads: DashMap<String, Arc<Semaphore>>,
    thread_pools: DashMap<String, Arc<ThreadPoolBulkhead>>,
    listened: DashMap<String, ()>,
}

const RETRY_SCHEDULER_CAPACITY: usize = 10;

impl ResiliencePrimitives {
    pub fn new() -> Self {
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            retry_scheduler: Arc::new(Semaphore::new(RETRY_SCHEDULER_CAPACITY)),
            bulkheads: DashMap::new(),
            thread_pools: DashMap::new(),
            listened: DashMap::new(),
        }
    }

    fn bulkhead(&self, service_name: &str, config: &BulkheadConfig) -> Arc<Semaphore> {
        if let Some(existing) = self.bulkheads.get(service_name) {
            return existing.clone();
        }
        self.bulkheads
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(config.max_concurrent_calls as usize)))
            .clone()
    }

    fn thread_pool(&self, service_name: &str, config: &ThreadPoolBulkheadConfig) -> Arc<ThreadPoolBulkhead> {
        if let Some(existing) = self.thread_pools.get(service_name) {
            return existing.clone();
        }
        self.thread_pools
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(ThreadPoolBulkhead::new(config)))
            .clone()
    }

    /// Invoked by the route-change listener: drop every memoized primitive
    /// for this service so the next call rebuilds from fresh config.
    pub fn invalidate(&self, service_name: &str) {
        self.breakers.invalidate(service_name);
        self.bulkheads.remove(service_name);
        self.thread_pools.remove(service_name);
    }

    /// Tracks whether the route-change invalidation listener for
    /// `service_name` has already been registered (idempotent registration,
    /// §9 "guard with a set").
    pub fn has_listener(&self, service_name: &str) -> bool {
        self.listened.contains_key(service_name)
    }

    pub fn mark_listener_registered(&self, service_name: &str) {
        self.listened.insert(service_name.to_string(), ());
    }
}

impl Default for ResiliencePrimitives {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the composed supplier for one call, applying `resilience.order`
/// right-to-left so the leftmost policy ends up outermost (glossary:
/// "the leftmost is outermost").
pub fn compose(
    resilience: &ResilienceConfig,
    service_name: &str,
    primitives: &ResiliencePrimitives,
    base: Supplier,
) -> Supplier {
    let mut supplier = base;
    for policy in resilience.order.iter().rev() {
        supplier = match policy {
            ResiliencePolicy::Retry => wrap_retry(supplier, resilience.retry.clone(), primitives.retry_scheduler.clone()),
            ResiliencePolicy::Fallback => {
                if resilience.fallback.enabled {
                    wrap_fallback(supplier, resilience.fallback.fallback_handler_name.clone())
                } else {
                    supplier
                }
            }
            ResiliencePolicy::CircuitBreaker => wrap_circuit_breaker(
                supplier,
                service_name.to_string(),
                resilience.circuit_breaker.clone(),
                primitives.breakers.clone(),
            ),
            ResiliencePolicy::Bulkhead => wrap_bulkhead(
                supplier,
                resilience.bulkhead.clone(),
                primitives.bulkhead(service_name, &resilience.bulkhead),
            ),
            ResiliencePolicy::ThreadPoolBulkhead => wrap_thread_pool_bulkhead(
                supplier,
                primitives.thread_pool(service_name, &resilience.thread_pool_bulkhead),
            ),
        };
    }
    supplier
}

fn wrap_retry(inner: Supplier, config: crate::config::RetryConfig, scheduler: Arc<Semaphore>) -> Supplier {
    Arc::new(move || {
        let inner = inner.clone();
        let config = config.clone();
        let scheduler = scheduler.clone();
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match inner().await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if attempt >= config.max_attempts {
                            return Err(e);
                        }
                        let _permit = scheduler
                            .acquire()
                            .await
                            .expect("retry scheduler semaphore is never closed");
                        tokio::time::sleep(Duration::from_millis(config.wait_duration_millis)).await;
                        attempt += 1;
                    }
                }
            }
        })
    })
}

/// Any uncaught failure becomes a `GATEWAY_FALLBACK`-coded response.
fn wrap_fallback(inner: Supplier, handler_name: String) -> Supplier {
    Arc::new(move || {
        let inner = inner.clone();
        let handler_name = handler_name.clone();
        Box::pin(async move {
            match inner().await {
                Ok(resp) => Ok(resp),
                Err(_) => Err(GatewayError::GatewayFallback(handler_name)),
            }
        })
    })
}

fn wrap_circuit_breaker(
    inner: Supplier,
    service_name: String,
    config: crate::config::CircuitBreakerConfig,
    breakers: Arc<CircuitBreakerRegistry>,
) -> Supplier {
    use crate::upstream::circuit_breaker::BreakerCheck;

    Arc::new(move || {
        let inner = inner.clone();
        let service_name = service_name.clone();
        let config = config.clone();
        let breakers = breakers.clone();
        Box::pin(async move {
            if matches!(breakers.check(&service_name, &config), BreakerCheck::Rejected) {
                return Err(GatewayError::ServiceUnavailable("circuit breaker open".to_string()));
            }
            let started = Instant::now();
            let result = inner().await;
            let elapsed = started.elapsed();
            match &result {
                Ok(_) => breakers.record_success(&service_name, &config, elapsed),
                Err(_) => breakers.record_failure(&service_name, &config, elapsed),
            }
            result
        })
    })
}

fn wrap_bulkhead(inner: Supplier, config: BulkheadConfig, semaphore: Arc<Semaphore>) -> Supplier {
    Arc::new(move || {
        let inner = inner.clone();
        let semaphore = semaphore.clone();
        let max_wait = Duration::from_millis(config.max_wait_millis);
        Box::pin(async move {
            let _permit = if max_wait.is_zero() {
                semaphore
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| GatewayError::ServiceUnavailable("bulkhead full".to_string()))?
            } else {
                tokio::time::timeout(max_wait, semaphore.clone().acquire_owned())
                    .await
                    .map_err(|_| GatewayError::ServiceUnavailable("bulkhead wait timeout".to_string()))?
                    .expect("bulkhead semaphore is never closed")
            };
            inner().await
        })
    })
}

fn wrap_thread_pool_bulkhead(inner: Supplier, pool: Arc<ThreadPoolBulkhead>) -> Supplier {
    Arc::new(move || {
        let inner = inner.clone();
        let pool = pool.clone();
        Box::pin(async move { pool.execute(inner).await })
    })
}
