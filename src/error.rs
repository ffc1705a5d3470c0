use std::fmt;

/// The gateway's error taxonomy, mapped 1:1 onto the coded responses of
/// §6.3. The response builder (`proxy::context`) is the single place that
/// turns one of these (or an unmatched error converted via a catch-all arm)
/// into a `GatewayResponse`.
#[derive(Debug)]
pub enum GatewayError {
    /// No configured route matched the request path.
    PathNoMatched,
    /// The matched route has no healthy, enabled instance to select.
    ServiceInstanceNotFound,
    /// A rate limiter rejected the request before any upstream call.
    TooManyRequests,
    /// A resilience fallback handler produced this response.
    GatewayFallback(String),
    /// The upstream call completed but with a non-2xx or transport failure
    /// that resilience left uncaught.
    HttpResponseError(String),
    /// The resilience stack exhausted its policies (open breaker, bulkhead
    /// rejection, retry exhaustion with no fallback) without admitting the
    /// call.
    ServiceUnavailable(String),
    /// Upstream connection could not be established.
    UpstreamConnect(String),
    /// Upstream call exceeded its configured timeout.
    UpstreamTimeout,
    /// Transport-level error surfaced by the HTTP client.
    Http(reqwest::Error),
    /// Service-discovery collaborator (Consul) failure.
    Consul(String),
    /// Config-source collaborator (etcd) failure.
    Config(String),
    /// Anything else — a bug, an invariant violation, a null reference in
    /// the original's terms.
    Internal(String),
}

impl GatewayError {
    /// The HTTP status this error is written back to the client as.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::PathNoMatched => 404,
            GatewayError::ServiceInstanceNotFound => 404,
            GatewayError::TooManyRequests => 429,
            GatewayError::GatewayFallback(_) => 200,
            GatewayError::HttpResponseError(_) => 502,
            GatewayError::ServiceUnavailable(_) => 503,
            GatewayError::UpstreamConnect(_) => 502,
            GatewayError::UpstreamTimeout => 502,
            GatewayError::Http(_) => 502,
            GatewayError::Consul(_) => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    /// The short code carried in the synthesized error body, matching §6.3.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PathNoMatched => "PATH_NO_MATCHED",
            GatewayError::ServiceInstanceNotFound => "SERVICE_INSTANCE_NOT_FOUND",
            GatewayError::TooManyRequests => "TOO_MANY_REQUESTS",
            GatewayError::GatewayFallback(_) => "GATEWAY_FALLBACK",
            GatewayError::HttpResponseError(_) => "HTTP_RESPONSE_ERROR",
            GatewayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            GatewayError::UpstreamConnect(_) => "HTTP_RESPONSE_ERROR",
            GatewayError::UpstreamTimeout => "HTTP_RESPONSE_ERROR",
            GatewayError::Http(_) => "HTTP_RESPONSE_ERROR",
            GatewayError::Consul(_) => "INTERNAL_ERROR",
            GatewayError::Config(_) => "INTERNAL_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::PathNoMatched => write!(f, "no route matched"),
            GatewayError::ServiceInstanceNotFound => write!(f, "no service instance available"),
            GatewayError::TooManyRequests => write!(f, "rate limited"),
            GatewayError::GatewayFallback(msg) => write!(f, "fallback response: {}", msg),
            GatewayError::HttpResponseError(msg) => write!(f, "upstream response error: {}", msg),
            GatewayError::ServiceUnavailable(msg) => write!(f, "service unavailable: {}", msg),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Consul(msg) => write!(f, "consul error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout
        } else if e.is_connect() {
            GatewayError::UpstreamConnect(e.to_string())
        } else {
            GatewayError::Http(e)
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
