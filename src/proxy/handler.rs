//! Ingress HTTP handler (C11, §4.4): resolves a route, builds the request
//! context, runs the fixed five-stage pipeline (CORS, flow, gray,
//! load-balance, resilience-wrapped upstream call), and writes the response
//! back.

use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, GatewayContext, GatewayRequest, GatewayResponse};
use crate::proxy::filter::{cors, flow, gray, load_balance, FilterChain};
use crate::resilience::{self, Supplier};
use crate::routing::resolve_route;
use crate::server::GatewayState;
use crate::upstream::client::UpstreamResponse;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let keep_alive = request_keep_alive(&req);
    let max_body_bytes = state.config.load().ingress.max_content_length_bytes;

    let request = match build_gateway_request(req, peer_addr, max_body_bytes).await {
        Ok(request) => request,
        Err(resp) => return Ok(resp),
    };

    let Some(route) = resolve_route(&state.registry, &request.path) else {
        return Ok(error_response_without_route(&GatewayError::PathNoMatched, keep_alive));
    };

    let mut ctx = GatewayContext::new(request, route, peer_addr, keep_alive);
    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "service" => ctx.service_name().to_string(),
    )
    .increment(1.0);

    state.ensure_invalidation_listener(ctx.service_name());
    let chain = state.chain_factory.get_or_build(&ctx.route);

    if chain.cors_enabled && cors::handle_preflight(&mut ctx) {
        cors::apply_headers(&mut ctx);
        return Ok(finalize(ctx, keep_alive));
    }

    if let Err(e) = run_pipeline(&state, &chain, &mut ctx).await {
        ctx.throwable = Some(e);
    }

    if chain.cors_enabled {
        cors::apply_headers(&mut ctx);
    }

    Ok(finalize(ctx, keep_alive))
}

/// Pre-hooks (flow, gray, load-balance) followed by the resilience-wrapped
/// upstream call (§4.4-§4.10).
async fn run_pipeline(
    state: &GatewayState,
    chain: &FilterChain,
    ctx: &mut GatewayContext,
) -> Result<(), GatewayError> {
    let service_name = ctx.service_name().to_string();

    flow::check(chain.flow.as_ref(), &service_name, &state.rate_limiters).await?;

    let instances = state.registry.instances(&service_name);
    gray::decide(&chain.gray, &instances, ctx);
    load_balance::select(&chain.load_balance, &instances, ctx)?;

    let resp = call_upstream(state, &service_name, ctx).await?;
    ctx.response = Some(GatewayResponse::Upstream {
        status: resp.status,
        headers: resp.headers,
        body: resp.body,
    });
    Ok(())
}

/// Builds the base upstream supplier and, when the route's resilience
/// policy is enabled, wraps it per `resilience::compose` (§4.10).
async fn call_upstream(
    state: &GatewayState,
    service_name: &str,
    ctx: &mut GatewayContext,
) -> Result<UpstreamResponse, GatewayError> {
    let method = upstream_method(&ctx.request.method)?;
    let url = upstream_url(ctx);

    let mut headers = ctx.request.headers.clone();
    remove_hop_headers(&mut headers);
    headers.remove(HOST);
    let body = ctx.request.body.clone();
    let client = state.upstream_client.clone();

    let base: Supplier = Arc::new(move || {
        let client = client.clone();
        let method = method.clone();
        let url = url.clone();
        let headers = headers.clone();
        let body = body.clone();
        Box::pin(async move { client.send(method, url, headers, body).await })
    });

    let resilience = ctx.route.definition.resilience.clone();
    ctx.upstream_start = Some(Instant::now());

    if !resilience.enabled {
        return base().await;
    }

    let fallback_enabled = resilience.fallback.enabled;
    let supplier = resilience::compose(&resilience, service_name, &state.resilience, base);

    // §4.10/§7: any uncaught failure from the composed stack becomes
    // SERVICE_UNAVAILABLE when no fallback is configured to handle it —
    // retry exhaustion and timeouts must not leak through as the upstream's
    // own HTTP_RESPONSE_ERROR code once resilience governs the call.
    match supplier().await {
        Ok(resp) => Ok(resp),
        Err(e) if fallback_enabled => Err(e),
        Err(e) => Err(GatewayError::ServiceUnavailable(e.to_string())),
    }
}

/// Reassembles the upstream request URL from the route's modified scheme /
/// host / path, falling back to the inbound request's own values, and
/// carrying over any query string from the original URI.
fn upstream_url(ctx: &GatewayContext) -> String {
    let scheme = ctx.request.modify_scheme.as_deref().unwrap_or("http");
    let host = ctx
        .request
        .modify_host
        .as_deref()
        .unwrap_or(&ctx.request.host);
    let path = ctx
        .request
        .modify_path
        .as_deref()
        .unwrap_or(&ctx.request.path);
    let query = ctx.request.uri.split_once('?').map(|(_, q)| q);

    let mut url = format!("{scheme}://{host}{path}");
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn upstream_method(method: &str) -> Result<reqwest::Method, GatewayError> {
    reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| GatewayError::Internal(format!("invalid HTTP method: {method}")))
}

/// Final error/response write-back (§6.3, §7): one path for every exit,
/// whether the pipeline set a response or failed with a `GatewayError`.
fn finalize(mut ctx: GatewayContext, keep_alive: bool) -> Response<BoxBody> {
    if let Some(err) = ctx.throwable.take() {
        return ctx.error_response(&err);
    }
    let response = ctx
        .response
        .take()
        .expect("pipeline must set a response when no error occurred");
    let status = response.status();
    ctx.record_metrics(status);
    build_response(response, status, keep_alive)
}

fn build_response(response: GatewayResponse, status: u16, keep_alive: bool) -> Response<BoxBody> {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (mut headers, body) = match response {
        GatewayResponse::Upstream { headers, body, .. } => (headers, body),
        GatewayResponse::Synthesized { headers, content, .. } => (headers, content),
    };
    remove_hop_headers(&mut headers);
    headers.insert(
        CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );

    let mut builder = Response::builder().status(status_code);
    for (name, value) in headers.iter() {
        builder = builder.header(name.clone(), value.clone());
    }
    builder.body(full_body(body)).expect("response builder is valid")
}

/// A route-free error response for `PATH_NO_MATCHED` — resolution happens
/// before a `GatewayContext` (and therefore a service name for metrics) can
/// exist, so this bypasses `GatewayContext::error_response`.
fn error_response_without_route(err: &GatewayError, keep_alive: bool) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::NOT_FOUND);
    metrics::counter!(
        "gateway_http_requests_total",
        "service" => "unmatched",
        "method" => "",
        "status_code" => status.as_str().to_string(),
    )
    .increment(1);

    let body = format!(r#"{{"code":"{}","message":"{}"}}"#, err.code(), err);
    Response::builder()
        .status(status)
        .header("content-type", "application/json;charset=utf-8")
        .header(CONNECTION, if keep_alive { "keep-alive" } else { "close" })
        .body(full_body(body))
        .expect("static response is valid")
}

fn request_keep_alive(req: &Request<Incoming>) -> bool {
    match req.headers().get(CONNECTION).and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => req.version() != hyper::Version::HTTP_10,
    }
}

async fn build_gateway_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    max_body_bytes: usize,
) -> Result<GatewayRequest, Response<BoxBody>> {
    let (parts, body) = req.into_parts();

    let collected = match body.collect().await {
        Ok(collected) => collected,
        Err(e) => {
            warn!("proxy: failed to read request body, error={}", e);
            return Err(plain_error_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };
    let body_bytes = collected.to_bytes();
    if body_bytes.len() > max_body_bytes {
        return Err(plain_error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }

    let headers = parts.headers;
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = parts.uri.path().to_string();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let method = parts.method.as_str().to_string();

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let (content_type, charset) = parse_content_type(&headers);
    let query = parts
        .uri
        .query()
        .map(parse_query_string)
        .unwrap_or_default();
    let cookies = headers
        .get(http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(parse_cookies)
        .unwrap_or_default();

    Ok(GatewayRequest {
        id: request_id(),
        client_ip,
        host,
        path,
        uri,
        method,
        headers,
        content_type,
        charset,
        query,
        cookies,
        body: body_bytes,
        modify_scheme: None,
        modify_host: None,
        modify_path: None,
        is_gray: false,
    })
}

fn request_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: u64 = rand::random();
    format!("{millis}---{suffix:016x}")
}

fn parse_content_type(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let Some(raw) = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return (None, None);
    };
    let mut parts = raw.split(';');
    let content_type = parts.next().map(|s| s.trim().to_string());
    let charset = parts.find_map(|p| {
        let p = p.trim();
        p.strip_prefix("charset=").map(|c| c.trim_matches('"').to_string())
    });
    (content_type, charset)
}

fn parse_query_string(query: &str) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let key = it.next().unwrap_or("");
        let value = it.next().unwrap_or("");
        map.insert(url_decode(key), url_decode(value));
    }
    map
}

fn parse_cookies(raw: &str) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for part in raw.split(';') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        map.insert(name.trim().to_string(), value.trim().to_string());
    }
    map
}

/// Minimal `application/x-www-form-urlencoded`-style percent-decoding — no
/// extra dependency needed for the handful of characters query strings and
/// cookie values actually use beyond what `+`/`%XX` cover.
fn url_decode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) => out.push(byte as char),
                    Err(_) => {
                        out.push('%');
                        out.push_str(&hex);
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn plain_error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain;charset=utf-8")
        .body(full_body(Bytes::copy_from_slice(message.as_bytes())))
        .expect("static response is valid")
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    const HOP_HEADERS: &[HeaderName] = &[
        CONNECTION,
        TRANSFER_ENCODING,
    ];
    for h in HOP_HEADERS {
        headers.remove(h);
    }
    for name in ["keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailers", "upgrade"] {
        headers.remove(name);
    }
}
