//! Load-balance pre-hook (§4.8): narrows the instance set to the gray or
//! healthy candidate pool, selects one, and writes it back as the
//! request's upstream target.

use crate::config::ServiceInstance;
use crate::error::GatewayError;
use crate::proxy::context::GatewayContext;
use crate::upstream::loadbalance::LoadBalancer;

pub fn select(
    load_balancer: &LoadBalancer,
    instances: &[ServiceInstance],
    ctx: &mut GatewayContext,
) -> Result<(), GatewayError> {
    let candidates: Vec<ServiceInstance> = if ctx.request.is_gray {
        instances
            .iter()
            .filter(|i| i.enabled && i.gray)
            .cloned()
            .collect()
    } else {
        instances
            .iter()
            .filter(|i| i.enabled && !i.gray)
            .cloned()
            .collect()
    };

    let client_host = ctx.request.client_ip.to_string();
    let picked = if ctx.request.is_gray {
        load_balancer.select_gray(&candidates, &client_host)
    } else {
        load_balancer.select(&candidates, &client_host)
    };

    match picked {
        Some(instance) => {
            ctx.request.modify_host = Some(instance.addr());
            Ok(())
        }
        None => Err(GatewayError::ServiceInstanceNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalanceFilterConfig, LoadBalanceStrategyKind};
    use crate::proxy::context::GatewayRequest;
    use crate::registry::Route;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    fn route() -> Arc<Route> {
        Arc::new(Route {
            definition: crate::config::RouteDefinition {
                id: "r1".into(),
                service_name: "svc".into(),
                uri: "/api/**".into(),
                order: 0,
                filter_configs: Vec::new(),
                resilience: Default::default(),
            },
            pattern: Arc::new(regex::Regex::new("^/api/.*$").unwrap()),
        })
    }

    fn ctx(is_gray: bool) -> GatewayContext {
        let request = GatewayRequest {
            id: "1---a".into(),
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            host: "localhost".into(),
            path: "/api/x".into(),
            uri: "/api/x".into(),
            method: "GET".into(),
            headers: HeaderMap::new(),
            content_type: None,
            charset: None,
            query: HashMap::new(),
            cookies: HashMap::new(),
            body: Bytes::new(),
            modify_scheme: None,
            modify_host: None,
            modify_path: None,
            is_gray,
        };
        GatewayContext::new(
            request,
            route(),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
            true,
        )
    }

    fn instance(id: &str, enabled: bool, gray: bool) -> ServiceInstance {
        instance_at(id, enabled, gray, "10.0.0.1")
    }

    fn instance_at(id: &str, enabled: bool, gray: bool, ip: &str) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.into(),
            ip: ip.into(),
            port: 8080,
            weight: 100,
            threshold: 0.5,
            enabled,
            gray,
        }
    }

    #[test]
    fn empty_candidate_pool_fails_with_no_instance() {
        let lb = LoadBalancer::new(LoadBalanceFilterConfig::default());
        let mut c = ctx(false);
        let err = select(&lb, &[], &mut c).unwrap_err();
        assert!(matches!(err, GatewayError::ServiceInstanceNotFound));
    }

    #[test]
    fn non_gray_request_excludes_gray_instances() {
        let lb = LoadBalancer::new(LoadBalanceFilterConfig {
            strategy: LoadBalanceStrategyKind::RoundRobin,
            ..LoadBalanceFilterConfig::default()
        });
        let mut c = ctx(false);
        let instances = vec![
            instance_at("gray1", true, true, "10.0.0.9"),
            instance_at("prod1", true, false, "10.0.0.1"),
        ];
        // Only one non-gray candidate exists, so every pick (regardless of
        // strategy cursor) must land on it — proves gray1 is excluded, not
        // just that round-robin happened to skip it this time.
        for _ in 0..3 {
            select(&lb, &instances, &mut c).unwrap();
            assert_eq!(c.request.modify_host.as_deref(), Some("10.0.0.1:8080"));
        }
    }

    #[test]
    fn gray_request_uses_gray_candidates_only() {
        let lb = LoadBalancer::new(LoadBalanceFilterConfig::default());
        let mut c = ctx(true);
        let instances = vec![
            instance_at("gray1", true, true, "10.0.0.9"),
            instance_at("prod1", true, false, "10.0.0.1"),
        ];
        select(&lb, &instances, &mut c).unwrap();
        assert_eq!(c.request.modify_host.as_deref(), Some("10.0.0.9:8080"));
    }

    #[test]
    fn gray_request_with_no_gray_candidates_fails() {
        let lb = LoadBalancer::new(LoadBalanceFilterConfig::default());
        let mut c = ctx(true);
        let instances = vec![instance("prod1", true, false)];
        let err = select(&lb, &instances, &mut c).unwrap_err();
        assert!(matches!(err, GatewayError::ServiceInstanceNotFound));
    }
}
