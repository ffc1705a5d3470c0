//! Dynamic Config Registry (C5, §4.2): the in-memory authoritative view of
//! routes, service definitions, and instances, with listener fan-out on
//! route change.

use crate::config::{RouteDefinition, ServiceDefinition, ServiceInstance};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;

/// A route plus its compiled match pattern, built once at installation time
/// so resolution (C6) never recompiles a regex.
pub struct Route {
    pub definition: RouteDefinition,
    pub pattern: Arc<Regex>,
}

/// Invoked with the new `RouteDefinition` whenever a route for the
/// registered service changes. Used to invalidate per-service caches
/// (filter chain, rate limiter, resilience primitives).
pub type RouteListener = Arc<dyn Fn(&RouteDefinition) + Send + Sync>;

fn compile_pattern(uri: &str) -> Regex {
    let mut pattern = String::with_capacity(uri.len() + 2);
    pattern.push('^');
    let mut chars = uri.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'*') {
            chars.next();
            pattern.push_str(".*");
        } else {
            pattern.push_str(&regex::escape(&c.to_string()));
        }
    }
    pattern.push('$');
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").expect("static regex is valid"))
}

#[derive(Default)]
pub struct Registry {
    routes_by_id: DashMap<String, Arc<Route>>,
    routes_by_service: DashMap<String, Vec<Arc<Route>>>,
    routes_by_uri: DashMap<String, Arc<Route>>,
    services: DashMap<String, ServiceDefinition>,
    instances: DashMap<String, DashMap<String, ServiceInstance>>,
    listeners: DashMap<String, ArcSwap<Vec<RouteListener>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the full route set. If `clear`, all three route indices are
    /// dropped before repopulating; otherwise routes are upserted in place.
    pub fn update_routes(&self, routes: Vec<RouteDefinition>, clear: bool) {
        if clear {
            self.routes_by_id.clear();
            self.routes_by_service.clear();
            self.routes_by_uri.clear();
        }
        for def in routes {
            self.insert_route(def);
        }
    }

    fn insert_route(&self, def: RouteDefinition) {
        let route = Arc::new(Route {
            pattern: Arc::new(compile_pattern(&def.uri)),
            definition: def.clone(),
        });

        self.routes_by_id.insert(def.id.clone(), route.clone());
        self.routes_by_uri.insert(def.uri.clone(), route.clone());
        self.routes_by_service
            .entry(def.service_name.clone())
            .and_modify(|routes| {
                routes.retain(|r| r.definition.id != def.id);
                routes.push(route.clone());
            })
            .or_insert_with(|| vec![route]);
    }

    /// Updates (or inserts) a single route and fans the new definition out
    /// to every listener registered for `route.serviceName`.
    pub fn change_route(&self, def: RouteDefinition) {
        let service_name = def.service_name.clone();
        self.insert_route(def.clone());
        if let Some(listeners) = self.listeners.get(&service_name) {
            for listener in listeners.load().iter() {
                listener(&def);
            }
        }
    }

    /// Registers a listener for route changes affecting `service_name`.
    /// Copy-on-write: concurrent registrations never lose each other.
    pub fn add_route_listener(&self, service_name: &str, listener: RouteListener) {
        let slot = self
            .listeners
            .entry(service_name.to_string())
            .or_insert_with(|| ArcSwap::new(Arc::new(Vec::new())));
        let current = slot.load_full();
        let mut next = (*current).clone();
        next.push(listener);
        slot.store(Arc::new(next));
    }

    pub fn update_service(&self, def: ServiceDefinition) {
        self.services.insert(def.service_name.clone(), def);
    }

    /// Full replace of a service's instance set.
    pub fn update_instances(&self, service_name: &str, new_set: Vec<ServiceInstance>) {
        let map = DashMap::new();
        for inst in new_set {
            map.insert(inst.instance_id.clone(), inst);
        }
        self.instances.insert(service_name.to_string(), map);
    }

    pub fn add_service_instance(&self, service_name: &str, instance: ServiceInstance) {
        self.instances
            .entry(service_name.to_string())
            .or_default()
            .insert(instance.instance_id.clone(), instance);
    }

    pub fn remove_service_instance(&self, service_name: &str, instance_id: &str) {
        if let Some(map) = self.instances.get(service_name) {
            map.remove(instance_id);
        }
    }

    pub fn route_by_id(&self, id: &str) -> Option<Arc<Route>> {
        self.routes_by_id.get(id).map(|e| e.value().clone())
    }

    pub fn route_by_uri(&self, uri: &str) -> Option<Arc<Route>> {
        self.routes_by_uri.get(uri).map(|e| e.value().clone())
    }

    pub fn routes_for_service(&self, service_name: &str) -> Vec<Arc<Route>> {
        self.routes_by_service
            .get(service_name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// All routes, for the route resolver (C6) to scan against an inbound path.
    pub fn all_routes(&self) -> Vec<Arc<Route>> {
        self.routes_by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn service(&self, service_name: &str) -> Option<ServiceDefinition> {
        self.services.get(service_name).map(|e| e.value().clone())
    }

    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.instances
            .get(service_name)
            .map(|m| m.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn route_count(&self) -> usize {
        self.routes_by_id.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Every service name currently referenced by a route, for callers that
    /// need to drive per-service discovery (Consul polling) off the route
    /// table rather than a separately-maintained service list.
    pub fn service_names(&self) -> Vec<String> {
        self.routes_by_service.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, ResilienceConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn route(id: &str, service: &str, uri: &str, order: i32) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            service_name: service.to_string(),
            uri: uri.to_string(),
            order,
            filter_configs: Vec::<FilterConfig>::new(),
            resilience: ResilienceConfig::default(),
        }
    }

    #[test]
    fn update_routes_populates_all_three_indices() {
        let registry = Registry::new();
        registry.update_routes(vec![route("r1", "svc-a", "/api/**", 1)], true);

        assert!(registry.route_by_id("r1").is_some());
        assert!(registry.route_by_uri("/api/**").is_some());
        assert_eq!(registry.routes_for_service("svc-a").len(), 1);
    }

    #[test]
    fn update_routes_clear_drops_stale_entries() {
        let registry = Registry::new();
        registry.update_routes(vec![route("r1", "svc-a", "/api/**", 1)], true);
        registry.update_routes(vec![route("r2", "svc-b", "/other/**", 1)], true);

        assert!(registry.route_by_id("r1").is_none());
        assert!(registry.route_by_id("r2").is_some());
        assert_eq!(registry.route_count(), 1);
    }

    #[test]
    fn compiled_pattern_matches_double_star() {
        let registry = Registry::new();
        registry.update_routes(vec![route("r1", "svc-a", "/api/**", 1)], true);
        let r = registry.route_by_id("r1").unwrap();
        assert!(r.pattern.is_match("/api/users/42"));
        assert!(!r.pattern.is_match("/other/path"));
    }

    #[test]
    fn change_route_fans_out_to_listeners() {
        let registry = Registry::new();
        registry.update_routes(vec![route("r1", "svc-a", "/api/**", 1)], true);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.add_route_listener(
            "svc-a",
            Arc::new(move |_def: &RouteDefinition| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.change_route(route("r1", "svc-a", "/api/v2/**", 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let updated = registry.route_by_id("r1").unwrap();
        assert_eq!(updated.definition.uri, "/api/v2/**");
    }

    #[test]
    fn listeners_for_other_services_not_invoked() {
        let registry = Registry::new();
        registry.update_routes(
            vec![
                route("r1", "svc-a", "/a/**", 1),
                route("r2", "svc-b", "/b/**", 1),
            ],
            true,
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.add_route_listener(
            "svc-a",
            Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.change_route(route("r2", "svc-b", "/b/v2/**", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn instances_full_replace_drops_removed_entries() {
        let registry = Registry::new();
        let inst = |id: &str| ServiceInstance {
            instance_id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            weight: 100,
            threshold: 0.0,
            enabled: true,
            gray: false,
        };

        registry.update_instances("svc-a", vec![inst("i1"), inst("i2")]);
        assert_eq!(registry.instances("svc-a").len(), 2);

        registry.update_instances("svc-a", vec![inst("i3")]);
        let instances = registry.instances("svc-a");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, "i3");
    }

    #[test]
    fn add_and_remove_single_instance() {
        let registry = Registry::new();
        let inst = ServiceInstance {
            instance_id: "i1".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 8080,
            weight: 100,
            threshold: 0.0,
            enabled: true,
            gray: false,
        };
        registry.add_service_instance("svc-a", inst);
        assert_eq!(registry.instances("svc-a").len(), 1);

        registry.remove_service_instance("svc-a", "i1");
        assert_eq!(registry.instances("svc-a").len(), 0);
    }
}
