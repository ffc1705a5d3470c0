use crate::config::{GatewayConfig, RouteDefinition};
use crate::discovery::ConsulClient;
use crate::etcd::EtcdClient;
use crate::metrics::Metrics;
use crate::proxy::filter::ChainFactory;
use crate::ratelimit::RateLimiterRegistry;
use crate::registry::Registry;
use crate::resilience::ResiliencePrimitives;
use crate::server::instance_registry::InstanceRegistry;
use crate::upstream::UpstreamClient;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Infrastructure: etcd client, instance registry, discovery wake.
#[derive(Clone)]
pub struct InfraState {
    etcd_client: Option<EtcdClient>,
    instance_registry: Option<Arc<InstanceRegistry>>,
    discovery_wake: Arc<Notify>,
}

impl InfraState {
    pub fn etcd_client(&self) -> Option<&EtcdClient> {
        self.etcd_client.as_ref()
    }

    pub fn instance_registry(&self) -> Option<&Arc<InstanceRegistry>> {
        self.instance_registry.as_ref()
    }

    pub fn discovery_wake(&self) -> Arc<Notify> {
        self.discovery_wake.clone()
    }

    pub fn trigger_discovery(&self) {
        self.discovery_wake.notify_one();
    }

    pub async fn shutdown(&self) {
        if let Some(ref registry) = self.instance_registry {
            registry.shutdown().await;
        }
    }
}

/// Shared gateway state, cheaply cloneable.
///
/// `registry` is the dynamic config registry (§4.2) — the single
/// authoritative view of routes, services, and instances. Everything else
/// here is either a per-service cache keyed off the registry's route
/// changes (`rate_limiters`, `chain_factory`, `resilience`) or an
/// infrastructure collaborator the bootstrap loops drive (`infra`).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub registry: Arc<Registry>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub chain_factory: Arc<ChainFactory>,
    pub resilience: Arc<ResiliencePrimitives>,
    pub upstream_client: UpstreamClient,
    pub infra: InfraState,
}

impl GatewayState {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let etcd_client = if !config.etcd.endpoints.is_empty() {
            let client = EtcdClient::connect(&config.etcd).await?;
            info!("etcd: connected to {}", client.base_url());
            Some(client)
        } else {
            None
        };

        let instance_count = Arc::new(AtomicU32::new(1));

        let instance_registry = if config.instance_registry.enabled {
            let etcd = etcd_client
                .clone()
                .ok_or_else(|| anyhow::anyhow!("instance_registry requires etcd endpoints"))?;
            let registry = InstanceRegistry::new(etcd, &config.instance_registry, instance_count.clone());
            info!("instance_registry: prepared, id={}", registry.instance_id());
            Some(Arc::new(registry))
        } else {
            info!("instance_registry: disabled (standalone rate limiting)");
            None
        };

        let rate_limiters = if instance_registry.is_some() {
            Arc::new(RateLimiterRegistry::with_instance_count(instance_count))
        } else {
            Arc::new(RateLimiterRegistry::new())
        };

        let upstream_client = UpstreamClient::new(&config.upstream_client);
        let metrics = Metrics::install();
        metrics::gauge!("gateway_config_routes_total").set(0.0);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            registry: Arc::new(Registry::new()),
            rate_limiters,
            chain_factory: Arc::new(ChainFactory::new()),
            resilience: Arc::new(ResiliencePrimitives::new()),
            upstream_client,
            infra: InfraState {
                etcd_client,
                instance_registry,
                discovery_wake: Arc::new(Notify::new()),
            },
        })
    }

    pub fn consul_client(&self) -> ConsulClient {
        let cfg = self.config.load();
        ConsulClient::new(&cfg.consul.address, cfg.consul.token.clone(), cfg.consul.datacenter.clone())
    }

    /// Applies a full reload of the route set (§6.2): the etcd watcher
    /// re-scans its prefix on every PUT/DELETE event rather than tracking
    /// individual deletes, so this always replaces the whole table, then
    /// fans each definition out through `change_route` so per-service
    /// listeners (rate limiter / chain / resilience invalidation) fire.
    pub fn apply_route_definitions(&self, routes: Vec<RouteDefinition>) {
        self.registry.update_routes(routes.clone(), true);
        for def in routes {
            self.registry.change_route(def);
        }
        self.update_route_metric();
        self.infra.trigger_discovery();
    }

    /// Registers, at most once per service, the combined invalidation
    /// listener that drops every per-service cache on the next route
    /// change. `ChainFactory`'s listener set is the dedup guard since the
    /// request path always builds a chain before it can need a rate
    /// limiter or resilience primitives for the same service.
    pub fn ensure_invalidation_listener(&self, service_name: &str) {
        if self.chain_factory.has_listener(service_name) {
            return;
        }
        self.chain_factory.mark_listener_registered(service_name);

        let chain_factory = self.chain_factory.clone();
        let rate_limiters = self.rate_limiters.clone();
        let resilience = self.resilience.clone();
        self.registry.add_route_listener(
            service_name,
            Arc::new(move |def: &RouteDefinition| {
                chain_factory.invalidate(&def.service_name);
                rate_limiters.invalidate(&def.service_name);
                resilience.invalidate(&def.service_name);
            }),
        );
    }

    pub fn route_count(&self) -> usize {
        self.registry.route_count()
    }

    pub fn service_count(&self) -> usize {
        self.registry.service_count()
    }

    fn update_route_metric(&self) {
        metrics::gauge!("gateway_config_routes_total").set(self.registry.route_count() as f64);
    }
}
