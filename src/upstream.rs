use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};

use crate::dedup::{cached_response, CachedResponse};
use crate::helpers::is_hop_by_hop_http_header;

/// Client identity attached to every forwarded request.
pub struct ForwardIdentity<'a> {
    pub ip: &'a str,
    pub tls_fp: &'a str,
    pub browser: &'a str,
    pub bot: &'a str,
}

/// Pooled upstream HTTP client. Built once at bootstrap; the
/// connection pool is shared across domains.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(64)
            .build()?;
        Ok(Self { client })
    }

    /// Hand a buffered request to the origin and buffer the answer.
    /// Buffering is what lets the deduplicator fan a single response
    /// out to every waiter.
    pub async fn forward(
        &self,
        backend: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        identity: ForwardIdentity<'_>,
    ) -> Result<CachedResponse, reqwest::Error> {
        let url = format!("{backend}{path_and_query}");
        let mut request = self.client.request(method, url);

        for (name, value) in headers {
            if is_hop_by_hop_http_header(name.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }

        request = request
            .header("X-Forwarded-For", identity.ip)
            .header("X-Real-IP", identity.ip)
            .header("proxy-real-ip", identity.ip)
            .header("proxy-tls-fp", identity.tls_fp)
            .header(
                "proxy-tls-name",
                format!("{}{}", identity.browser, identity.bot),
            );

        let response = request.body(body).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;

        Ok(cached_response(status, headers, bytes.to_vec()))
    }
}

/// Rebuild an axum response from a buffered upstream answer.
pub fn into_response(cached: &CachedResponse) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::BAD_GATEWAY));

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &cached.headers {
            if is_hop_by_hop_http_header(name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }

    builder
        .body(Body::from(cached.body.clone()))
        .unwrap_or_else(|_| bad_gateway())
}

pub fn bad_gateway() -> Response<Body> {
    let mut response = Response::new(Body::from("502 Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        "Content-Type",
        HeaderValue::from_static("text/plain"),
    );
    response
}
