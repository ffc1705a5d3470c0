pub mod circuit_breaker;
pub mod client;
pub mod loadbalance;

pub use circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
pub use client::UpstreamClient;
pub use loadbalance::LoadBalancer;
