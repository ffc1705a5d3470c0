//! Shared upstream HTTP client (C10, §4.11): one process-wide `reqwest`
//! client with connection pooling, used for every upstream call regardless
//! of which service/route issued it.

use crate::config::UpstreamClientConfig;
use crate::error::GatewayError;
use bytes::Bytes;
use http::HeaderMap;
use std::time::Duration;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamClientConfig) -> Self {
        let redirect_policy = if config.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(config.max_redirects as usize)
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(config.connect_timeout_secs))
            .timeout(Duration::from_secs_f64(config.request_timeout_secs))
            .redirect(redirect_policy)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .gzip(true)
            .brotli(true)
            .build()
            .expect("upstream http client config is valid");

        Self { http }
    }

    /// Dispatches one request to `url`, returning the full buffered response.
    /// Transport errors are classified into `GatewayError` by the shared
    /// `From<reqwest::Error>` impl (timeout vs connect vs generic).
    pub async fn send(
        &self,
        method: reqwest::Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, GatewayError> {
        let mut req = self.http.request(method, url).headers(headers);
        if !body.is_empty() {
            req = req.body(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(UpstreamResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_from_defaults() {
        let config = UpstreamClientConfig::default();
        let _client = UpstreamClient::new(&config);
    }

    #[test]
    fn builds_client_with_redirects_disabled() {
        let config = UpstreamClientConfig {
            max_redirects: 0,
            ..UpstreamClientConfig::default()
        };
        let _client = UpstreamClient::new(&config);
    }
}
