use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// `LeakyBucket(capacity C, leakIntervalMillis I)`: a FIFO queue plus a
/// `level` counter in `[0, C]`. Admission enqueues without advancing the
/// caller; a periodic leak task dequeues one waiter every `I` ms and admits
/// it. The caller's `try_consume` future resolves only when the leak task
/// lets it through (or the bucket is dropped, in which case it resolves to
/// rejected).
pub struct LeakyBucket {
    capacity: u64,
    level: AtomicU64,
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_interval_millis: u64) -> Arc<Self> {
        let bucket = Arc::new(LeakyBucket {
            capacity,
            level: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
        });

        let leak_handle = bucket.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(leak_interval_millis.max(1)));
            loop {
                interval.tick().await;
                leak_handle.leak_one();
            }
        });

        bucket
    }

    fn leak_one(&self) {
        let waiter = {
            let mut q = self.queue.lock().unwrap();
            q.pop_front()
        };
        if let Some(waiter) = waiter {
            self.level.fetch_sub(1, Ordering::SeqCst);
            let _ = waiter.send(());
        }
    }

    /// Enqueues and suspends until the leak task admits this caller, or
    /// returns `false` immediately if the bucket is already at capacity.
    pub async fn try_consume(&self) -> bool {
        let mut cur = self.level.load(Ordering::SeqCst);
        loop {
            if cur >= self.capacity {
                return false;
            }
            match self.level.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }

        let (tx, rx) = oneshot::channel();
        self.queue.lock().unwrap().push_back(tx);
        rx.await.is_ok()
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
