//! Gray-release strategies (C4, §4.7) deciding whether a request should be
//! routed to a canary instance.

use crate::config::{GrayFilterConfig, GrayStrategyKind, ServiceInstance};
use crate::hashring::hash_key;

/// Whether this request should be treated as gray traffic, given the
/// instance set for the resolved service.
///
/// If there exists an instance that is both enabled and gray, a strategy is
/// selected from `config.strategy`; otherwise gray routing is impossible and
/// this returns `false` without consulting the strategy.
pub fn should_route_to_gray(
    config: &GrayFilterConfig,
    instances: &[ServiceInstance],
    client_host: &str,
) -> bool {
    let has_gray_candidate = instances.iter().any(|i| i.enabled && i.gray);
    if !has_gray_candidate {
        return false;
    }

    match config.strategy {
        GrayStrategyKind::Threshold => threshold_strategy(config, instances),
        GrayStrategyKind::ClientIp => client_ip_strategy(config, instances, client_host),
    }
}

fn gray_threshold(config: &GrayFilterConfig, instances: &[ServiceInstance]) -> f64 {
    let sum: f64 = instances
        .iter()
        .filter(|i| i.enabled && i.gray)
        .map(|i| i.threshold)
        .sum();
    sum.min(config.max_gray_threshold)
}

fn has_non_gray_enabled_instance(instances: &[ServiceInstance]) -> bool {
    instances.iter().any(|i| i.enabled && !i.gray)
}

/// `random() <= min(sum of instance.threshold, maxGrayThreshold)`; if no
/// enabled non-gray instance exists, force gray (there is nothing else to
/// route to). The draw is a plain uniform sample in `[0,1)` — see
/// DESIGN.md's Open Question resolution for `Math.abs(Math.random() - 1)`.
fn threshold_strategy(config: &GrayFilterConfig, instances: &[ServiceInstance]) -> bool {
    if !has_non_gray_enabled_instance(instances) {
        return true;
    }
    let threshold = gray_threshold(config, instances);
    rand::random::<f64>() < threshold
}

/// `|hash(clientHost)| mod 100` compared with `grayThreshold * 100`; the
/// same client host always gets the same decision while thresholds are
/// stable.
fn client_ip_strategy(
    config: &GrayFilterConfig,
    instances: &[ServiceInstance],
    client_host: &str,
) -> bool {
    if !has_non_gray_enabled_instance(instances) {
        return true;
    }
    let threshold = gray_threshold(config, instances);
    let bucket = hash_key(client_host) % 100;
    (bucket as f64) < threshold * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, enabled: bool, gray: bool, threshold: f64) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            weight: 100,
            threshold,
            enabled,
            gray,
        }
    }

    fn config(strategy: GrayStrategyKind, max: f64) -> GrayFilterConfig {
        GrayFilterConfig {
            enabled: true,
            strategy,
            max_gray_threshold: max,
        }
    }

    #[test]
    fn no_gray_candidate_never_routes_gray() {
        let instances = vec![instance("a", true, false, 0.0)];
        let cfg = config(GrayStrategyKind::Threshold, 1.0);
        assert!(!should_route_to_gray(&cfg, &instances, "10.0.0.5"));
    }

    #[test]
    fn force_gray_when_no_non_gray_enabled_instance() {
        let instances = vec![instance("a", true, true, 0.1)];
        let cfg = config(GrayStrategyKind::Threshold, 1.0);
        assert!(should_route_to_gray(&cfg, &instances, "10.0.0.5"));
    }

    #[test]
    fn client_ip_strategy_is_deterministic_for_same_host() {
        let instances = vec![
            instance("a", true, false, 0.0),
            instance("b", true, true, 0.9),
        ];
        let cfg = config(GrayStrategyKind::ClientIp, 1.0);
        let first = should_route_to_gray(&cfg, &instances, "203.0.113.7");
        let second = should_route_to_gray(&cfg, &instances, "203.0.113.7");
        assert_eq!(first, second);
    }

    #[test]
    fn client_ip_strategy_zero_threshold_never_gray() {
        let instances = vec![
            instance("a", true, false, 0.0),
            instance("b", true, true, 0.0),
        ];
        let cfg = config(GrayStrategyKind::ClientIp, 1.0);
        for host in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            assert!(!should_route_to_gray(&cfg, &instances, host));
        }
    }

    #[test]
    fn gray_threshold_is_capped_at_max() {
        let instances = vec![
            instance("a", true, false, 0.0),
            instance("b", true, true, 5.0),
        ];
        let cfg = config(GrayStrategyKind::Threshold, 0.3);
        assert_eq!(gray_threshold(&cfg, &instances), 0.3);
    }
}
