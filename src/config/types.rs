use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration. Infrastructure only — business config
/// (routes, services, instances) is owned exclusively by the dynamic
/// registry and is never read from this file or the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub consul: ConsulConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Self-registration to Consul so upstream gateways can discover us.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Gateways register themselves in etcd and track peer count to split
    /// rate limits evenly across instances.
    #[serde(default)]
    pub instance_registry: InstanceRegistryConfig,

    /// Shared async HTTP client settings for upstream calls (§4.11).
    #[serde(default)]
    pub upstream_client: UpstreamClientConfig,

    /// Ingress request-aggregation limits (§6.1).
    #[serde(default)]
    pub ingress: IngressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// How often to poll consul for service changes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    /// Key prefix under which each key holds one route's JSON document
    /// (§6.2 payload schema).
    #[serde(default = "default_etcd_route_prefix")]
    pub route_prefix: String,

    /// etcd key prefix for controller metadata (e.g. config_revision).
    #[serde(default)]
    pub meta_prefix: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            route_prefix: default_etcd_route_prefix(),
            meta_prefix: None,
            username: None,
            password: None,
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_route_prefix() -> String {
    "/hermes/routes".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_registration_service_name")]
    pub service_name: String,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_deregister_after_secs")]
    pub deregister_after_secs: u64,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_registration_service_name(),
            ttl_secs: default_ttl_secs(),
            deregister_after_secs: default_deregister_after_secs(),
            metadata: HashMap::new(),
        }
    }
}

fn default_registration_service_name() -> String {
    "hermes-gateway".to_string()
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_deregister_after_secs() -> u64 {
    60
}

/// Each gateway registers under a shared etcd prefix with a lease.
/// All instances watch this prefix to know total peer count, then divide
/// rate/count limits evenly for decentralized distributed rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_instance_prefix")]
    pub prefix: String,

    /// Lease TTL in seconds. Auto-expires if keepalive stops.
    #[serde(default = "default_instance_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for InstanceRegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_instance_prefix(),
            lease_ttl_secs: default_instance_lease_ttl(),
        }
    }
}

fn default_instance_prefix() -> String {
    "/hermes/instances".to_string()
}

fn default_instance_lease_ttl() -> u64 {
    15
}

/// Shared upstream HTTP client settings (§4.11) — connect/request timeouts,
/// pooling, compression. One client for the whole process; not per-service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamClientConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: f64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_connections_per_host: default_max_connections_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

fn default_connect_timeout_secs() -> f64 {
    6.0
}

fn default_request_timeout_secs() -> f64 {
    6.0
}

fn default_max_redirects() -> u32 {
    0
}

fn default_max_connections_per_host() -> usize {
    320
}

fn default_pool_idle_timeout_secs() -> u64 {
    60
}

/// Ingress request-aggregation limits (§6.1: "Request aggregator caps body
/// at `maxContentLength` (default 64 MiB)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_max_content_length_bytes")]
    pub max_content_length_bytes: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_content_length_bytes: default_max_content_length_bytes(),
        }
    }
}

fn default_max_content_length_bytes() -> usize {
    64 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Business config (§3 DATA MODEL) — owned by the dynamic registry, supplied
// exclusively by the config-source / service-source collaborators (§6.2).
// ---------------------------------------------------------------------------

/// A declarative mapping from a URI pattern to a named service plus
/// per-request policy. `(id, service_name, uri)` are each indexed by the
/// registry (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub id: String,
    pub service_name: String,

    /// `**` expands to `.*`; other characters match literally (§4.1).
    pub uri: String,

    /// Smaller wins.
    #[serde(default)]
    pub order: i32,

    #[serde(default)]
    pub filter_configs: Vec<FilterConfig>,

    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// `name` identifies a built-in (`cors`, `flow`, `gray`, `loadbalance`) or a
/// custom filter; `config` is interpreted by that filter's own typed view
/// (`FlowFilterConfig`, `GrayFilterConfig`, `LoadBalanceFilterConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
}

/// Typed view of a `flow` `FilterConfig.config` blob (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub algorithm: RateLimitAlgorithm,

    /// Bucket/window capacity `C`.
    pub capacity: u64,

    /// Token bucket refill rate per second `R`. Ignored by other algorithms.
    #[serde(default)]
    pub refill_per_second: u64,

    /// Sliding-window width `W` in milliseconds. Ignored by other algorithms.
    #[serde(default)]
    pub window_millis: u64,

    /// Leaky-bucket leak interval `I` in milliseconds. Ignored by other algorithms.
    #[serde(default)]
    pub leak_interval_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrayStrategyKind {
    Threshold,
    ClientIp,
}

/// Typed view of a `gray` `FilterConfig.config` blob (§4.7). Absent ⇒ enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrayFilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gray_strategy")]
    pub strategy: GrayStrategyKind,

    #[serde(default = "default_max_gray_threshold")]
    pub max_gray_threshold: f64,
}

impl Default for GrayFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_gray_strategy(),
            max_gray_threshold: default_max_gray_threshold(),
        }
    }
}

fn default_gray_strategy() -> GrayStrategyKind {
    GrayStrategyKind::Threshold
}

fn default_max_gray_threshold() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceStrategyKind {
    Random,
    RoundRobin,
    ClientIpHash,
    ClientIpConsistentHash,
    Weight,
    Gray,
}

/// Typed view of a `loadbalance` `FilterConfig.config` blob (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalanceFilterConfig {
    #[serde(default = "default_lb_strategy")]
    pub strategy: LoadBalanceStrategyKind,

    /// Round robin only: atomic (`true`, strict) vs plain (`false`, loose).
    #[serde(default = "default_true")]
    pub round_robin_strict: bool,

    /// Consistent hash only: virtual nodes placed per physical node.
    #[serde(default = "default_virtual_node_num")]
    pub virtual_node_num: u32,
}

impl Default for LoadBalanceFilterConfig {
    fn default() -> Self {
        Self {
            strategy: default_lb_strategy(),
            round_robin_strict: true,
            virtual_node_num: default_virtual_node_num(),
        }
    }
}

fn default_lb_strategy() -> LoadBalanceStrategyKind {
    LoadBalanceStrategyKind::RoundRobin
}

fn default_virtual_node_num() -> u32 {
    160
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResiliencePolicy {
    Retry,
    Fallback,
    CircuitBreaker,
    Bulkhead,
    ThreadPoolBulkhead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlidingWindowType {
    TimeBased,
    CountBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_wait_duration_millis")]
    pub wait_duration_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wait_duration_millis: default_wait_duration_millis(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_wait_duration_millis() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_fallback_handler")]
    pub fallback_handler_name: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fallback_handler_name: default_fallback_handler(),
        }
    }
}

fn default_fallback_handler() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_slow_call_rate_threshold")]
    pub slow_call_rate_threshold: f64,

    #[serde(default = "default_slow_call_duration_millis")]
    pub slow_call_duration_millis: u64,

    #[serde(default = "default_half_open_permitted_calls")]
    pub half_open_permitted_calls: u32,

    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    #[serde(default = "default_sliding_window_type")]
    pub sliding_window_type: SlidingWindowType,

    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: u32,

    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            slow_call_rate_threshold: default_slow_call_rate_threshold(),
            slow_call_duration_millis: default_slow_call_duration_millis(),
            half_open_permitted_calls: default_half_open_permitted_calls(),
            minimum_calls: default_minimum_calls(),
            sliding_window_type: default_sliding_window_type(),
            sliding_window_size: default_sliding_window_size(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_slow_call_rate_threshold() -> f64 {
    100.0
}

fn default_slow_call_duration_millis() -> u64 {
    1000
}

fn default_half_open_permitted_calls() -> u32 {
    10
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_sliding_window_type() -> SlidingWindowType {
    SlidingWindowType::CountBased
}

fn default_sliding_window_size() -> u32 {
    100
}

fn default_open_duration_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkheadConfig {
    #[serde(default = "default_bulkhead_max_concurrent")]
    pub max_concurrent_calls: u32,

    #[serde(default = "default_bulkhead_max_wait_millis")]
    pub max_wait_millis: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_bulkhead_max_concurrent(),
            max_wait_millis: default_bulkhead_max_wait_millis(),
        }
    }
}

fn default_bulkhead_max_concurrent() -> u32 {
    25
}

fn default_bulkhead_max_wait_millis() -> u64 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPoolBulkheadConfig {
    #[serde(default = "default_core_pool_size")]
    pub core_pool_size: usize,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        Self {
            core_pool_size: default_core_pool_size(),
            max_pool_size: default_max_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_core_pool_size() -> usize {
    4
}

fn default_max_pool_size() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    100
}

/// Ordered decorator stack over the upstream call (§4.10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub order: Vec<ResiliencePolicy>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    #[serde(default)]
    pub thread_pool_bulkhead: ThreadPoolBulkheadConfig,
}

/// `serviceName` plus metadata (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub service_name: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// An addressable endpoint of a service (§3). `threshold` is this instance's
/// share of gray traffic in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,

    #[serde(default = "default_instance_weight")]
    pub weight: u32,

    #[serde(default)]
    pub threshold: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub gray: bool,
}

fn default_instance_weight() -> u32 {
    100
}

impl ServiceInstance {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.consul.address, "http://127.0.0.1:8500");
        assert_eq!(cfg.consul.poll_interval_secs, 10);
        assert_eq!(cfg.etcd.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(cfg.etcd.route_prefix, "/hermes/routes");
        assert!(!cfg.registration.enabled);
        assert!(!cfg.instance_registry.enabled);
        assert_eq!(cfg.upstream_client.connect_timeout_secs, 6.0);
        assert_eq!(cfg.upstream_client.max_connections_per_host, 320);
    }

    #[test]
    fn test_route_definition_from_wire_schema() {
        let json = r#"{
            "id": "r1",
            "serviceName": "users",
            "uri": "/api/users/**",
            "order": 10,
            "filterConfigs": [
                {"name": "flow", "enable": true, "config": {"enabled": true, "algorithm": "TOKEN_BUCKET", "capacity": 100, "refillPerSecond": 10}}
            ],
            "resilience": {
                "enabled": true,
                "order": ["RETRY", "CIRCUIT_BREAKER"],
                "retry": {"maxAttempts": 2, "waitDurationMillis": 50}
            }
        }"#;

        let route: RouteDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(route.id, "r1");
        assert_eq!(route.service_name, "users");
        assert_eq!(route.uri, "/api/users/**");
        assert_eq!(route.order, 10);
        assert_eq!(route.filter_configs.len(), 1);
        assert_eq!(route.filter_configs[0].name, "flow");
        assert!(route.resilience.enabled);
        assert_eq!(
            route.resilience.order,
            vec![ResiliencePolicy::Retry, ResiliencePolicy::CircuitBreaker]
        );
        assert_eq!(route.resilience.retry.max_attempts, 2);

        let flow: FlowFilterConfig =
            serde_json::from_value(route.filter_configs[0].config.clone()).unwrap();
        assert_eq!(flow.algorithm, RateLimitAlgorithm::TokenBucket);
        assert_eq!(flow.capacity, 100);
        assert_eq!(flow.refill_per_second, 10);
    }

    #[test]
    fn test_resilience_config_defaults() {
        let rc = ResilienceConfig::default();
        assert!(!rc.enabled);
        assert!(rc.order.is_empty());
        assert_eq!(rc.retry.max_attempts, 3);
        assert!(!rc.fallback.enabled);
        assert_eq!(rc.circuit_breaker.failure_rate_threshold, 50.0);
        assert_eq!(rc.bulkhead.max_concurrent_calls, 25);
        assert_eq!(rc.thread_pool_bulkhead.core_pool_size, 4);
    }

    #[test]
    fn test_gray_filter_config_defaults() {
        let g = GrayFilterConfig::default();
        assert!(g.enabled);
        assert_eq!(g.strategy, GrayStrategyKind::Threshold);
        assert_eq!(g.max_gray_threshold, 1.0);
    }

    #[test]
    fn test_load_balance_filter_config_defaults() {
        let lb = LoadBalanceFilterConfig::default();
        assert_eq!(lb.strategy, LoadBalanceStrategyKind::RoundRobin);
        assert!(lb.round_robin_strict);
        assert_eq!(lb.virtual_node_num, 160);
    }

    #[test]
    fn test_service_instance_defaults_and_addr() {
        let json = r#"{"instanceId": "i1", "ip": "10.0.0.5", "port": 8080}"#;
        let inst: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.weight, 100);
        assert_eq!(inst.threshold, 0.0);
        assert!(inst.enabled);
        assert!(!inst.gray);
        assert_eq!(inst.addr(), "10.0.0.5:8080");
    }
}
