//! CORS pre/post hooks (§4.5). The only built-in filter with no typed
//! config of its own — presence in a route's `filterConfigs` is the whole
//! switch.

use crate::proxy::context::{GatewayContext, GatewayResponse};
use http::{HeaderValue, StatusCode};

/// Pre-hook: OPTIONS requests are answered locally and never reach the
/// upstream call. Returns `true` when the chain should terminate here.
pub fn handle_preflight(ctx: &mut GatewayContext) -> bool {
    if ctx.request.method != "OPTIONS" {
        return false;
    }
    ctx.response = Some(GatewayResponse::synthesized(
        StatusCode::OK,
        "application/json;charset=utf-8",
        full_body_bytes(),
    ));
    true
}

fn full_body_bytes() -> bytes::Bytes {
    bytes::Bytes::from_static(br#"{"code":"SUCCESS","message":"ok"}"#)
}

/// Post-hook: unconditionally stamps the CORS headers, whether the response
/// came from the preflight short-circuit or from a completed upstream call.
pub fn apply_headers(ctx: &mut GatewayContext) {
    let Some(response) = ctx.response.as_mut() else {
        return;
    };
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn ctx(method: &str) -> GatewayContext {
        let request = GatewayRequest {
            id: "1---a".into(),
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host: "localhost".into(),
            path: "/api/x".into(),
            uri: "/api/x".into(),
            method: method.into(),
            headers: HeaderMap::new(),
            content_type: None,
            charset: None,
            query: HashMap::new(),
            cookies: HashMap::new(),
            body: Bytes::new(),
            modify_scheme: None,
            modify_host: None,
            modify_path: None,
            is_gray: false,
        };
        GatewayContext::new(
            request,
            route(),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
            true,
        )
    }

    #[test]
    fn options_short_circuits_with_synthesized_response() {
        let mut c = ctx("OPTIONS");
        assert!(handle_preflight(&mut c));
        assert_eq!(c.response.as_ref().unwrap().status(), 200);
    }

    #[test]
    fn non_options_passes_through() {
        let mut c = ctx("GET");
        assert!(!handle_preflight(&mut c));
        assert!(c.response.is_none());
    }

    #[test]
    fn post_hook_stamps_headers_on_any_response() {
        let mut c = ctx("GET");
        c.response = Some(GatewayResponse::synthesized(
            StatusCode::OK,
            "application/json",
            Bytes::new(),
        ));
        apply_headers(&mut c);
        let headers = c.response.as_ref().unwrap();
        match headers {
            GatewayResponse::Synthesized { headers, .. } => {
                assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
            }
            _ => unreachable!(),
        }
    }
}
