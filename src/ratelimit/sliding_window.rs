use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `SlidingWindow(capacity C, windowMillis W)`: a strict deque of admission
/// timestamps — no blended/approximated previous-window weighting. Evicts
/// expired timestamps from the head on every admission check.
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(capacity: u64, window_millis: u64) -> Self {
        SlidingWindow {
            capacity: capacity as usize,
            window: Duration::from_millis(window_millis),
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn try_consume(&self) -> bool {
        let now = Instant::now();
        let mut ts = self.timestamps.lock().unwrap();
        while let Some(&front) = ts.front() {
            if now.duration_since(front) > self.window {
                ts.pop_front();
            } else {
                break;
            }
        }
        if ts.len() < self.capacity {
            ts.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_within_window() {
        let w = SlidingWindow::new(3, 10_000);
        assert!(w.try_consume());
        assert!(w.try_consume());
        assert!(w.try_consume());
        assert!(!w.try_consume());
    }

    #[test]
    fn evicts_expired_entries() {
        let w = SlidingWindow::new(1, 20);
        assert!(w.try_consume());
        assert!(!w.try_consume());
        std::thread::sleep(Duration::from_millis(40));
        assert!(w.try_consume());
    }
}
