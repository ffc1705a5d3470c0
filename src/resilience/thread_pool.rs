//! Bounded thread-pool bulkhead (§4.10): offloads the supplied call onto a
//! capacity-limited pool and surfaces its result back into the async chain.
//! `core_pool_size` is carried for schema parity with the source config but
//! doesn't drive distinct behavior — tokio has no warm/cold worker
//! distinction, so `max_pool_size` alone sizes the bound.

use crate::error::GatewayError;
use crate::resilience::Supplier;
use crate::upstream::client::UpstreamResponse;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

pub struct ThreadPoolBulkhead {
    semaphore: Semaphore,
    queued: AtomicUsize,
    queue_capacity: usize,
}

impl ThreadPoolBulkhead {
    pub fn new(config: &crate::config::ThreadPoolBulkheadConfig) -> Self {
        Self {
            semaphore: Semaphore::new(config.max_pool_size),
            queued: AtomicUsize::new(0),
            queue_capacity: config.queue_capacity,
        }
    }

    pub async fn execute(&self, supplier: Supplier) -> Result<UpstreamResponse, GatewayError> {
        if self.semaphore.available_permits() == 0 && self.queued.load(Ordering::Acquire) >= self.queue_capacity {
            return Err(GatewayError::ServiceUnavailable(
                "thread pool bulkhead saturated".to_string(),
            ));
        }

        self.queued.fetch_add(1, Ordering::AcqRel);
        let permit = self.semaphore.acquire().await.expect("thread pool semaphore is never closed");
        self.queued.fetch_sub(1, Ordering::AcqRel);

        let handle = tokio::spawn(async move { supplier().await });
        let result = handle
            .await
            .map_err(|_| GatewayError::Internal("thread pool bulkhead task panicked".to_string()));
        drop(permit);
        result?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadPoolBulkheadConfig;
    use http::HeaderMap;
    use std::sync::Arc;

    fn ok_response() -> UpstreamResponse {
        UpstreamResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn executes_supplier_on_pool() {
        let pool = ThreadPoolBulkhead::new(&ThreadPoolBulkheadConfig::default());
        let supplier: Supplier = Arc::new(|| Box::pin(async { Ok(ok_response()) }));
        let result = pool.execute(supplier).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_when_pool_and_queue_are_saturated() {
        let config = ThreadPoolBulkheadConfig {
            core_pool_size: 1,
            max_pool_size: 1,
            queue_capacity: 0,
        };
        let pool = Arc::new(ThreadPoolBulkhead::new(&config));
        let blocker: Supplier = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(ok_response())
            })
        });
        let pool_clone = pool.clone();
        let handle = tokio::spawn(async move { pool_clone.execute(blocker).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let rejected = pool
            .execute(Arc::new(|| Box::pin(async { Ok(ok_response()) })))
            .await;
        assert!(matches!(rejected, Err(GatewayError::ServiceUnavailable(_))));
        let _ = handle.await;
    }
}
