//! Rate-based circuit breaker (part of C9, §4.10), keyed by `serviceName`.
//!
//! Unlike a simple consecutive-failure counter, admission is governed by the
//! failure and slow-call *rate* over a sliding window, evaluated only once
//! the window holds at least `minimum_calls` outcomes.

use crate::config::{CircuitBreakerConfig, SlidingWindowType};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<ServiceBreaker>>,
}

struct CallRecord {
    at: Instant,
    failed: bool,
    slow: bool,
}

struct ServiceBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    half_open_calls: AtomicU32,
    half_open_successes: AtomicU32,
    window: Mutex<VecDeque<CallRecord>>,
    config: CircuitBreakerConfig,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit breaker before a request.
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open — this is one of the permitted probes.
    Probe,
    /// Breaker is open — reject immediately, no upstream call attempted.
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn check(&self, service_name: &str, config: &CircuitBreakerConfig) -> BreakerCheck {
        self.get_or_create(service_name, config).check()
    }

    pub fn record_success(&self, service_name: &str, config: &CircuitBreakerConfig, elapsed: Duration) {
        self.get_or_create(service_name, config)
            .record_outcome(elapsed, false);
    }

    pub fn record_failure(&self, service_name: &str, config: &CircuitBreakerConfig, elapsed: Duration) {
        self.get_or_create(service_name, config)
            .record_outcome(elapsed, true);
    }

    fn get_or_create(&self, service_name: &str, config: &CircuitBreakerConfig) -> Arc<ServiceBreaker> {
        if let Some(entry) = self.breakers.get(service_name) {
            return entry.value().clone();
        }
        self.breakers
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(ServiceBreaker::new(config.clone())))
            .clone()
    }

    /// Invoked by the route-change listener (§4.10): drop the memoized
    /// breaker so the next call rebuilds it from fresh config.
    pub fn invalidate(&self, service_name: &str) {
        self.breakers.remove(service_name);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            opened_at: Mutex::new(None),
            half_open_calls: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            window: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let elapsed_enough = {
                    let opened_at = self.opened_at.lock().unwrap();
                    opened_at
                        .map(|at| at.elapsed() >= Duration::from_secs(self.config.open_duration_secs))
                        .unwrap_or(false)
                };
                if elapsed_enough
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.half_open_calls.store(0, Ordering::Relaxed);
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    self.window.lock().unwrap().clear();
                }
                match self.state.load(Ordering::Acquire) {
                    STATE_HALF_OPEN => self.probe_or_reject(),
                    _ => BreakerCheck::Rejected,
                }
            }
            STATE_HALF_OPEN => self.probe_or_reject(),
            _ => BreakerCheck::Allowed,
        }
    }

    fn probe_or_reject(&self) -> BreakerCheck {
        let slot = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
        if slot < self.config.half_open_permitted_calls {
            BreakerCheck::Probe
        } else {
            BreakerCheck::Rejected
        }
    }

    fn record_outcome(&self, elapsed: Duration, failed: bool) {
        let slow = elapsed >= Duration::from_millis(self.config.slow_call_duration_millis);
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => self.record_half_open_outcome(failed),
            _ => self.record_closed_outcome(failed, slow),
        }
    }

    fn record_closed_outcome(&self, failed: bool, slow: bool) {
        let mut window = self.window.lock().unwrap();
        window.push_back(CallRecord {
            at: Instant::now(),
            failed,
            slow,
        });
        self.trim_window(&mut window);

        let total = window.len() as u32;
        if total < self.config.minimum_calls {
            return;
        }
        let failures = window.iter().filter(|r| r.failed).count() as f64;
        let slows = window.iter().filter(|r| r.slow).count() as f64;
        let failure_rate = failures / total as f64 * 100.0;
        let slow_rate = slows / total as f64 * 100.0;

        if failure_rate >= self.config.failure_rate_threshold
            || slow_rate >= self.config.slow_call_rate_threshold
        {
            drop(window);
            self.trip_open();
        }
    }

    fn record_half_open_outcome(&self, failed: bool) {
        if failed {
            self.trip_open();
            return;
        }
        let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= self.config.half_open_permitted_calls {
            self.state.store(STATE_CLOSED, Ordering::Release);
            self.window.lock().unwrap().clear();
            tracing::info!("circuit_breaker: closed (recovered after {} probes)", successes);
        }
    }

    fn trip_open(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        tracing::warn!("circuit_breaker: opened");
    }

    /// Count-based: keep the last `sliding_window_size` calls. Time-based:
    /// keep calls within the last `sliding_window_size` seconds.
    fn trim_window(&self, window: &mut VecDeque<CallRecord>) {
        match self.config.sliding_window_type {
            SlidingWindowType::CountBased => {
                while window.len() > self.config.sliding_window_size as usize {
                    window.pop_front();
                }
            }
            SlidingWindowType::TimeBased => {
                let cutoff = Duration::from_secs(self.config.sliding_window_size as u64);
                while let Some(front) = window.front() {
                    if front.at.elapsed() > cutoff {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlidingWindowType;

    fn config(minimum_calls: u32, failure_rate: f64, open_duration_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: failure_rate,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_millis: 1000,
            half_open_permitted_calls: 2,
            minimum_calls,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 10,
            open_duration_secs,
        }
    }

    #[test]
    fn starts_closed() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(2, 50.0, 30);
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn opens_once_minimum_calls_and_rate_exceeded() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(4, 50.0, 30);
        for _ in 0..2 {
            reg.record_success("svc", &cfg, Duration::from_millis(1));
        }
        for _ in 0..2 {
            reg.record_failure("svc", &cfg, Duration::from_millis(1));
        }
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Rejected));
    }

    #[test]
    fn stays_closed_below_minimum_calls() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(10, 10.0, 30);
        for _ in 0..3 {
            reg.record_failure("svc", &cfg, Duration::from_millis(1));
        }
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn half_open_after_open_duration_elapses() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(2, 50.0, 0);
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Probe));
    }

    #[test]
    fn half_open_success_up_to_permitted_calls_closes() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(2, 50.0, 0);
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let _ = reg.check("svc", &cfg);
        reg.record_success("svc", &cfg, Duration::from_millis(1));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Probe));
        reg.record_success("svc", &cfg, Duration::from_millis(1));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(2, 50.0, 0);
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        let _ = reg.check("svc", &cfg);
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Rejected));
    }

    #[test]
    fn slow_calls_trip_breaker_via_slow_rate() {
        let reg = CircuitBreakerRegistry::new();
        let mut cfg = config(2, 100.0, 30);
        cfg.slow_call_duration_millis = 5;
        cfg.slow_call_rate_threshold = 50.0;
        reg.record_success("svc", &cfg, Duration::from_millis(50));
        reg.record_success("svc", &cfg, Duration::from_millis(50));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Rejected));
    }

    #[test]
    fn invalidate_drops_memoized_breaker_state() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = config(2, 50.0, 30);
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        reg.record_failure("svc", &cfg, Duration::from_millis(1));
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Rejected));
        reg.invalidate("svc");
        assert!(matches!(reg.check("svc", &cfg), BreakerCheck::Allowed));
    }
}
