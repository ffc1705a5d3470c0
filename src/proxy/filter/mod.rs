//! Filter chain & factory (C7) plus the built-in filters themselves (C8,
//! §4.3, §4.5-§4.8). Per the resolved design note in §4.4, the chain is not
//! a literal `Vec<dyn Filter>` walked by a cursor — it is realized as a
//! fixed five-stage pipeline (CORS, flow, gray, load-balance, terminal
//! route) driven by a straight-line `async fn` in `proxy::handler`. This
//! module owns the per-service composition and its memoized cache; the
//! submodules own each stage's pre/post-hook logic.

pub mod cors;
pub mod flow;
pub mod gray;
pub mod load_balance;

use crate::config::{FilterConfig, FlowFilterConfig, GrayFilterConfig, LoadBalanceFilterConfig};
use crate::registry::Route;
use crate::upstream::loadbalance::LoadBalancer;
use dashmap::DashMap;
use std::sync::Arc;

/// The resolved, per-service filter set for one route. Built once per
/// service and reused across requests until a route change invalidates it.
pub struct FilterChain {
    pub cors_enabled: bool,
    pub flow: Option<FlowFilterConfig>,
    pub gray: GrayFilterConfig,
    pub load_balance: Arc<LoadBalancer>,
}

fn find_config<'a>(configs: &'a [FilterConfig], name: &str) -> Option<&'a FilterConfig> {
    configs.iter().find(|c| c.name == name && c.enable)
}

impl FilterChain {
    /// Composition per §4.3: CORS and flow only run when explicitly
    /// configured on the route; gray and load-balance always run, falling
    /// back to their defaults when the route carries no explicit entry —
    /// a request always needs a gray decision and an instance selection,
    /// but CORS headers and rate limiting are opt-in per route.
    fn build(route: &Route) -> Self {
        let configs = &route.definition.filter_configs;

        let cors_enabled = find_config(configs, "cors").is_some();

        let flow = find_config(configs, "flow").and_then(|c| {
            serde_json::from_value::<FlowFilterConfig>(c.config.clone()).ok()
        });

        let gray = find_config(configs, "gray")
            .and_then(|c| serde_json::from_value::<GrayFilterConfig>(c.config.clone()).ok())
            .unwrap_or_default();

        let load_balance_config = find_config(configs, "loadbalance")
            .and_then(|c| serde_json::from_value::<LoadBalanceFilterConfig>(c.config.clone()).ok())
            .unwrap_or_default();

        Self {
            cors_enabled,
            flow,
            gray,
            load_balance: Arc::new(LoadBalancer::new(load_balance_config)),
        }
    }
}

/// Per-service chain cache (§4.3, §5, §9): populated under atomic
/// compute-if-absent, invalidated by a route-change listener registered at
/// most once per service (mirroring `RateLimiterRegistry`/
/// `ResiliencePrimitives`).
#[derive(Default)]
pub struct ChainFactory {
    chains: DashMap<String, Arc<FilterChain>>,
    listened: DashMap<String, ()>,
}

impl ChainFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, route: &Route) -> Arc<FilterChain> {
        let service_name = &route.definition.service_name;
        if let Some(existing) = self.chains.get(service_name) {
            return existing.clone();
        }
        self.chains
            .entry(service_name.clone())
            .or_insert_with(|| Arc::new(FilterChain::build(route)))
            .clone()
    }

    pub fn invalidate(&self, service_name: &str) {
        self.chains.remove(service_name);
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
    use crate::config::{ResilienceConfig, RouteDefinition};
    use serde_json::json;

    fn route_with_configs(configs: Vec<FilterConfig>) -> Route {
        Route {
            definition: RouteDefinition {
                id: "r1".into(),
                service_name: "svc-a".into(),
                uri: "/api/**".into(),
                order: 0,
                filter_configs: configs,
                resilience: ResilienceConfig::default(),
            },
            pattern: Arc::new(regex::Regex::new("^/api/.*$").unwrap()),
        }
    }

    #[test]
    fn cors_and_flow_absent_by_default() {
        let route = route_with_configs(vec![]);
        let chain = FilterChain::build(&route);
        assert!(!chain.cors_enabled);
        assert!(chain.flow.is_none());
    }

    #[test]
    fn gray_and_load_balance_default_when_route_has_no_entry() {
        let route = route_with_configs(vec![]);
        let chain = FilterChain::build(&route);
        assert!(chain.gray.enabled);
    }

    #[test]
    fn explicit_flow_config_is_parsed() {
        let route = route_with_configs(vec![FilterConfig {
            name: "flow".into(),
            enable: true,
            config: json!({
                "enabled": true,
                "algorithm": "TOKEN_BUCKET",
                "capacity": 10,
                "refillPerSecond": 5
            }),
        }]);
        let chain = FilterChain::build(&route);
        assert_eq!(chain.flow.unwrap().capacity, 10);
    }

    #[test]
    fn disabled_filter_config_entry_is_ignored() {
        let route = route_with_configs(vec![FilterConfig {
            name: "cors".into(),
            enable: false,
            config: serde_json::Value::Null,
        }]);
        let chain = FilterChain::build(&route);
        assert!(!chain.cors_enabled);
    }

    #[test]
    fn factory_memoizes_per_service_and_invalidates() {
        let factory = ChainFactory::new();
        let route = route_with_configs(vec![]);
        let a = factory.get_or_build(&route);
        let b = factory.get_or_build(&route);
        assert!(Arc::ptr_eq(&a, &b));

        factory.invalidate("svc-a");
        let c = factory.get_or_build(&route);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn listener_registration_is_tracked_once() {
        let factory = ChainFactory::new();
        assert!(!factory.has_listener("svc-a"));
        factory.mark_listener_registered("svc-a");
        assert!(factory.has_listener("svc-a"));
    }
}
