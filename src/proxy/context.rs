//! Request/response/context model (C12, §3, §4.4).

use crate::error::GatewayError;
use crate::registry::Route;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// Immutable view of the inbound request plus the mutation surface pre-hooks
/// use to steer routing (§3). Constructed once per inbound request.
pub struct GatewayRequest {
    /// `"{timestamp}---{uuid}"`, unique per request.
    pub id: String,
    pub client_ip: IpAddr,
    pub host: String,
    pub path: String,
    pub uri: String,
    pub method: String,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub query: HashMap<String, String>,
    /// Keyed by the cookie's own name (resolved open question, DESIGN.md —
    /// not by the query parameter name).
    pub cookies: HashMap<String, String>,
    pub body: Bytes,

    pub modify_scheme: Option<String>,
    pub modify_host: Option<String>,
    pub modify_path: Option<String>,
    pub is_gray: bool,
}

impl GatewayRequest {
    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|s| s.as_str())
    }
}

/// Either wraps an upstream response or is synthesized locally (§3). One
/// variant is populated exclusively — never both.
pub enum GatewayResponse {
    Upstream {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    Synthesized {
        status: u16,
        headers: HeaderMap,
        content: Bytes,
    },
}

impl GatewayResponse {
    pub fn synthesized(status: StatusCode, content_type: &str, content: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_str(content_type).unwrap(),
        );
        GatewayResponse::Synthesized {
            status: status.as_u16(),
            headers,
            content: content.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayResponse::Upstream { status, .. } => *status,
            GatewayResponse::Synthesized { status, .. } => *status,
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            GatewayResponse::Upstream { headers, .. } => headers,
            GatewayResponse::Synthesized { headers, .. } => headers,
        }
    }
}

/// Owns the request, the in-progress response, the resolved route and
/// filter chain, the chain cursor, and the bookkeeping needed to finalize
/// metrics/logs on write-back. One instance per inbound request, dropped
/// after write-back (§3).
pub struct GatewayContext {
    pub request: GatewayRequest,
    pub response: Option<GatewayResponse>,
    pub route: Arc<Route>,
    pub keep_alive: bool,
    pub throwable: Option<GatewayError>,

    /// Chain position, carried even though the chain itself runs as a
    /// straight-line `async fn` (§4.4 resolved design note) — observable
    /// for filter logic and tests exactly as the original describes.
    pub cur_filter_index: usize,
    pub is_do_pre_filter: bool,

    pub peer_addr: SocketAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl GatewayContext {
    pub fn new(request: GatewayRequest, route: Arc<Route>, peer_addr: SocketAddr, keep_alive: bool) -> Self {
        Self {
            request,
            response: None,
            route,
            keep_alive,
            throwable: None,
            cur_filter_index: 0,
            is_do_pre_filter: true,
            peer_addr,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.route.definition.service_name
    }

    /// Builds the coded JSON error response for `err` (§6.3, §7) and
    /// records final metrics in the same place so every error exit goes
    /// through one path.
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.record_metrics(status.as_u16());

        let body = format!(r#"{{"code":"{}","message":"{}"}}"#, err.code(), err);
        let mut builder = hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json;charset=utf-8");
        if self.keep_alive {
            builder = builder.header("connection", "keep-alive");
        } else {
            builder = builder.header("connection", "close");
        }
        builder.body(full_body(body)).expect("static response is valid")
    }

    pub fn record_metrics(&self, status_code: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status_code);
        let service = self.service_name().to_string();

        metrics::counter!(
            "gateway_http_requests_total",
            "service" => service.clone(),
            "method" => self.request.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "service" => service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "service" => service.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight", "service" => service).decrement(1.0);
    }
}
