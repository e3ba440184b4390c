//! The downstream handler seam and the upstream forwarding implementation.

use std::time::Duration;

use async_trait::async_trait;
use http::header::CONNECTION;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tracing::debug;

use super::request::{ClientRequest, PipelineResponse};
use crate::error::Result;

/// Headers that describe a single hop and are never copied across the proxy.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// A failure reported by the downstream handler.
#[derive(Debug, Error)]
pub enum DownstreamError {
    /// The upstream could not be reached or returned garbage
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The upstream did not answer in time
    #[error("upstream timed out")]
    Timeout,

    /// The handler failed with a specific status
    #[error("{message}")]
    Status { status: StatusCode, message: String },
}

impl DownstreamError {
    /// Status code to answer the client with.
    pub fn status(&self) -> StatusCode {
        match self {
            DownstreamError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            DownstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DownstreamError::Status { status, .. } => *status,
        }
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownstreamError::Timeout
        } else {
            DownstreamError::Unavailable(e.to_string())
        }
    }
}

/// Whatever handles a request once it has been admitted.
///
/// Implementations must not assume they run under any lock; the admission
/// decision is final before `call` is invoked.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Produce the response for an admitted request.
    async fn call(&self, request: &ClientRequest) -> std::result::Result<PipelineResponse, DownstreamError>;
}

/// Forwards admitted requests to an upstream HTTP service.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamForwarder {
    /// Create a forwarder for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // Upstreams are addressed directly; ambient proxy env vars do not apply.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target_url(&self, request: &ClientRequest) -> String {
        format!("{}{}", self.base_url, request.path_and_query())
    }
}

#[async_trait]
impl Downstream for UpstreamForwarder {
    async fn call(&self, request: &ClientRequest) -> std::result::Result<PipelineResponse, DownstreamError> {
        let url = self.target_url(request);
        debug!(method = %request.method, url = %url, "Forwarding request upstream");

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(forwardable_headers(&request.headers))
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = forwardable_headers(response.headers());
        let body = response.bytes().await?;

        Ok(PipelineResponse {
            status,
            headers,
            body,
        })
    }
}

/// Copy of `headers` without hop-by-hop entries, including any header named
/// in `Connection`.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(name);
    }
    for name in &listed {
        forwarded.remove(name.as_str());
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use http::header;
    use http::{Method, Uri};
    use tokio::net::TcpListener;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            DownstreamError::Unavailable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(DownstreamError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            DownstreamError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "maintenance".into(),
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_target_url_keeps_query_and_trims_slash() {
        let forwarder = UpstreamForwarder::new("http://backend:3000/", Duration::from_secs(1)).unwrap();
        let request = ClientRequest::new(Method::GET, Uri::from_static("/v1/items?limit=5"));

        assert_eq!(forwarder.base_url(), "http://backend:3000");
        assert_eq!(forwarder.target_url(&request), "http://backend:3000/v1/items?limit=5");
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "12".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());

        let forwarded = forwardable_headers(&headers);

        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_connection_listed_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, X-Session-Hint".parse().unwrap());
        headers.insert("x-session-hint", "abc".parse().unwrap());
        headers.insert(header::PROXY_AUTHENTICATE, "Basic".parse().unwrap());
        headers.insert("x-request-tag", "keep".parse().unwrap());

        let forwarded = forwardable_headers(&headers);

        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get("x-request-tag").unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_forwards_to_upstream() {
        let upstream = Router::new().route(
            "/echo",
            post(|body: String| async move { (StatusCode::CREATED, format!("echo: {}", body)) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let forwarder = UpstreamForwarder::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let request = ClientRequest::new(Method::POST, Uri::from_static("/echo")).with_body("hello");

        let response = forwarder.call(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, "echo: hello");
        server.abort();
    }

    #[tokio::test]
    async fn test_slow_upstream_is_gateway_timeout() {
        let upstream = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let forwarder =
            UpstreamForwarder::new(format!("http://{}", addr), Duration::from_millis(100)).unwrap();
        let request = ClientRequest::new(Method::GET, Uri::from_static("/slow"));

        let err = forwarder.call(&request).await.unwrap_err();

        assert!(matches!(err, DownstreamError::Timeout));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind and release a port so nothing is listening on it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let forwarder = UpstreamForwarder::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let request = ClientRequest::new(Method::GET, Uri::from_static("/"));

        let err = forwarder.call(&request).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
