//! Gray pre-hook (§4.7): decides `request.isGray` before load-balancing
//! picks the candidate pool.

use crate::config::{GrayFilterConfig, ServiceInstance};
use crate::gray::should_route_to_gray;
use crate::proxy::context::GatewayContext;

pub fn decide(config: &GrayFilterConfig, instances: &[ServiceInstance], ctx: &mut GatewayContext) {
    if !config.enabled {
        ctx.request.is_gray = false;
        return;
    }
    let client_host = ctx.request.client_ip.to_string();
    ctx.request.is_gray = should_route_to_gray(config, instances, &client_host);
}
