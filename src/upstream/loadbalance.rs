//! Load-balance strategies (C3, §4.8): choose one instance from a candidate
//! list resolved for a service.

use crate::config::{LoadBalanceFilterConfig, LoadBalanceStrategyKind, ServiceInstance};
use crate::hashring::{hash_key, HashRing};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-service load-balance state. Memoized by the load-balance filter
/// (§4.3) alongside the filter chain, so the round-robin counter survives
/// across requests for the same service.
pub struct LoadBalancer {
    config: LoadBalanceFilterConfig,
    counter: AtomicI64,
}

const ROUND_ROBIN_RESET_THRESHOLD: i64 = i32::MAX as i64 / 4;

impl LoadBalancer {
    pub fn new(config: LoadBalanceFilterConfig) -> Self {
        Self {
            config,
            counter: AtomicI64::new(0),
        }
    }

    /// Selects one instance from `candidates` (already filtered to the
    /// gray-or-healthy pool by the caller). Returns `None` only when
    /// `candidates` is empty.
    pub fn select<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        client_host: &str,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        match self.config.strategy {
            LoadBalanceStrategyKind::Random => random_select(candidates),
            LoadBalanceStrategyKind::RoundRobin => {
                if self.config.round_robin_strict {
                    self.round_robin_strict(candidates)
                } else {
                    self.round_robin_loose(candidates)
                }
            }
            LoadBalanceStrategyKind::ClientIpHash => client_ip_hash(candidates, client_host),
            LoadBalanceStrategyKind::ClientIpConsistentHash => {
                client_ip_consistent_hash(candidates, client_host, self.config.virtual_node_num)
            }
            LoadBalanceStrategyKind::Weight => weight_select(candidates),
            LoadBalanceStrategyKind::Gray => gray_select(candidates, client_host),
        }
    }

    /// Selects using the Gray strategy regardless of the configured
    /// strategy — used for gray-routed requests (§4.8: "use the Gray
    /// strategy"), independent of whatever strategy the service configured
    /// for its normal traffic.
    pub fn select_gray<'a>(
        &self,
        candidates: &'a [ServiceInstance],
        client_host: &str,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        gray_select(candidates, client_host)
    }

    /// Atomic counter: fetch-and-increment, reset to 0 once it exceeds
    /// `i32::MAX / 4` (resolved open question, DESIGN.md — the naive
    /// `(index+1) % n` reset under-resets).
    fn round_robin_strict<'a>(
        &self,
        candidates: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        if idx > ROUND_ROBIN_RESET_THRESHOLD {
            self.counter.store(0, Ordering::Relaxed);
        }
        candidates.get((idx.rem_euclid(candidates.len() as i64)) as usize)
    }

    /// Same counter, but a plain load-then-store instead of a
    /// read-modify-write primitive — concurrent callers can observe and
    /// reuse the same index, a benign race the spec accepts for the loose
    /// variant.
    fn round_robin_loose<'a>(
        &self,
        candidates: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let idx = self.counter.load(Ordering::Relaxed);
        let next = if idx > ROUND_ROBIN_RESET_THRESHOLD { 0 } else { idx + 1 };
        self.counter.store(next, Ordering::Relaxed);
        candidates.get((idx.rem_euclid(candidates.len() as i64)) as usize)
    }
}

fn random_select(candidates: &[ServiceInstance]) -> Option<&ServiceInstance> {
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    candidates.get(idx)
}

fn client_ip_hash<'a>(
    candidates: &'a [ServiceInstance],
    client_host: &str,
) -> Option<&'a ServiceInstance> {
    let idx = (hash_key(client_host) as usize) % candidates.len();
    candidates.get(idx)
}

fn client_ip_consistent_hash<'a>(
    candidates: &'a [ServiceInstance],
    client_host: &str,
    virtual_node_num: u32,
) -> Option<&'a ServiceInstance> {
    let ring = HashRing::new(
        candidates.iter().map(|i| i.instance_id.clone()),
        virtual_node_num,
    );
    let lookup_key = hash_key(client_host).to_string();
    ring.get_node(&lookup_key)
        .and_then(|id| candidates.iter().find(|i| &i.instance_id == id))
        .or_else(|| candidates.first())
}

fn weight_select(candidates: &[ServiceInstance]) -> Option<&ServiceInstance> {
    let total: u32 = candidates.iter().map(|i| i.weight).sum();
    if total == 0 {
        return candidates.first();
    }
    let mut draw = rand::thread_rng().gen_range(0..total) as i64;
    for inst in candidates {
        draw -= inst.weight as i64;
        if draw < 0 {
            return Some(inst);
        }
    }
    candidates.last()
}

/// Cumulative-subtraction over `threshold * 100` (scaled to integer), using
/// `|hash(clientHost)| mod totalThreshold` as the deterministic draw — the
/// same client host always lands on the same gray instance while
/// thresholds are stable.
fn gray_select<'a>(
    candidates: &'a [ServiceInstance],
    client_host: &str,
) -> Option<&'a ServiceInstance> {
    let total: i64 = candidates
        .iter()
        .map(|i| (i.threshold * 100.0).round() as i64)
        .sum();
    if total <= 0 {
        return candidates.first();
    }
    let mut draw = (hash_key(client_host) as i64) % total;
    for inst in candidates {
        draw -= (inst.threshold * 100.0).round() as i64;
        if draw < 0 {
            return Some(inst);
        }
    }
    candidates.last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, weight: u32, threshold: f64) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            weight,
            threshold,
            enabled: true,
            gray: false,
        }
    }

    fn lb(strategy: LoadBalanceStrategyKind) -> LoadBalancer {
        LoadBalancer::new(LoadBalanceFilterConfig {
            strategy,
            round_robin_strict: true,
            virtual_node_num: 160,
        })
    }

    #[test]
    fn empty_candidates_select_none() {
        let balancer = lb(LoadBalanceStrategyKind::Random);
        assert!(balancer.select(&[], "1.1.1.1").is_none());
    }

    #[test]
    fn round_robin_strict_cycles_in_order() {
        let balancer = lb(LoadBalanceStrategyKind::RoundRobin);
        let candidates = vec![
            instance("a", 1, 0.0),
            instance("b", 1, 0.0),
            instance("c", 1, 0.0),
        ];
        let picked: Vec<&str> = (0..6)
            .map(|_| balancer.select(&candidates, "x").unwrap().instance_id.as_str())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_strict_resets_past_threshold() {
        let balancer = lb(LoadBalanceStrategyKind::RoundRobin);
        balancer
            .counter
            .store(ROUND_ROBIN_RESET_THRESHOLD + 1, Ordering::Relaxed);
        let candidates = vec![instance("a", 1, 0.0)];
        balancer.select(&candidates, "x");
        assert_eq!(balancer.counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn client_ip_hash_is_deterministic() {
        let balancer = lb(LoadBalanceStrategyKind::ClientIpHash);
        let candidates = vec![instance("a", 1, 0.0), instance("b", 1, 0.0)];
        let first = balancer.select(&candidates, "203.0.113.9").unwrap().instance_id.clone();
        let second = balancer.select(&candidates, "203.0.113.9").unwrap().instance_id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn client_ip_consistent_hash_is_deterministic() {
        let balancer = lb(LoadBalanceStrategyKind::ClientIpConsistentHash);
        let candidates = vec![
            instance("a", 1, 0.0),
            instance("b", 1, 0.0),
            instance("c", 1, 0.0),
        ];
        let first = balancer.select(&candidates, "198.51.100.2").unwrap().instance_id.clone();
        let second = balancer.select(&candidates, "198.51.100.2").unwrap().instance_id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn weight_select_zero_weight_falls_back_to_first() {
        let balancer = lb(LoadBalanceStrategyKind::Weight);
        let candidates = vec![instance("a", 0, 0.0), instance("b", 0, 0.0)];
        assert_eq!(balancer.select(&candidates, "x").unwrap().instance_id, "a");
    }

    #[test]
    fn weight_select_converges_to_weight_ratio() {
        let balancer = lb(LoadBalanceStrategyKind::Weight);
        let candidates = vec![instance("a", 1, 0.0), instance("b", 3, 0.0)];
        let mut b_count = 0;
        for _ in 0..10_000 {
            if balancer.select(&candidates, "x").unwrap().instance_id == "b" {
                b_count += 1;
            }
        }
        let ratio = b_count as f64 / 10_000.0;
        assert!((ratio - 0.75).abs() < 0.05, "ratio was {ratio}");
    }

    #[test]
    fn gray_select_is_deterministic_per_client() {
        let balancer = lb(LoadBalanceStrategyKind::Gray);
        let candidates = vec![instance("a", 1, 0.2), instance("b", 1, 0.8)];
        let first = balancer.select(&candidates, "10.1.1.1").unwrap().instance_id.clone();
        let second = balancer.select(&candidates, "10.1.1.1").unwrap().instance_id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn gray_select_zero_total_threshold_falls_back_to_first() {
        let balancer = lb(LoadBalanceStrategyKind::Gray);
        let candidates = vec![instance("a", 1, 0.0), instance("b", 1, 0.0)];
        assert_eq!(balancer.select(&candidates, "x").unwrap().instance_id, "a");
    }
}
