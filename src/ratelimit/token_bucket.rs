use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `TokenBucket(capacity C, refillPerSecond R)`: an integer token counter in
/// `[0, C]`. Admission is a non-suspending atomic decrement; a background
/// task refills every 1000 ms.
pub struct TokenBucket {
    tokens: Arc<AtomicI64>,
    capacity: i64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_second: u64) -> Self {
        let capacity = capacity as i64;
        let refill = refill_per_second as i64;
        let tokens = Arc::new(AtomicI64::new(capacity));

        let refill_handle = tokens.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1000));
            loop {
                interval.tick().await;
                let mut cur = refill_handle.load(Ordering::Relaxed);
                loop {
                    let next = (cur + refill).min(capacity);
                    match refill_handle.compare_exchange_weak(
                        cur,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => cur = observed,
                    }
                }
            }
        });

        TokenBucket { tokens, capacity }
    }

    /// Atomically decrement; if the result is still `>= 0`, admit. Otherwise
    /// put the token back and reject.
    pub fn try_consume(&self) -> bool {
        let remaining = self.tokens.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining >= 0 {
            true
        } else {
            self.tokens.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> i64 {
        self.tokens.load(Ordering::SeqCst).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity_then_rejects() {
        let bucket = TokenBucket::new(3, 0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(2, 2);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;

        assert!(bucket.try_consume());
    }
}
