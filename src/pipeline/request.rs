//! Request and response values passed through the pipeline.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;

use crate::ratelimit::ClientId;

/// Body sent to clients that exceeded their quota.
pub const RATE_LIMITED_BODY: &str = "Too many requests. Try again later.";

/// An immutable description of an incoming request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Address of the connected peer, if the transport knows it
    pub peer_addr: Option<SocketAddr>,
}

impl ClientRequest {
    /// Create a request with no headers, body or peer address.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The client this request is attributed to.
    pub fn client_id(&self) -> Option<ClientId> {
        self.peer_addr.map(ClientId::from_peer)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query string, as forwarded upstream.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// Why the body of an admitted request could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    /// The body is larger than the configured limit
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// The body stream failed before it was complete
    #[error("failed to read request body: {0}")]
    Unreadable(String),
}

impl BodyError {
    /// Status code to answer the client with.
    pub fn status(&self) -> StatusCode {
        match self {
            BodyError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BodyError::Unreadable(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// The response produced for a request, whether by the downstream handler or
/// by a short-circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PipelineResponse {
    /// An empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A plain-text response.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// The 429 sent when a client is over quota.
    pub fn too_many_requests() -> Self {
        Self::text(StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY)
    }

    /// The 422 sent when a request has no client identifier and the limiter
    /// rejects such requests.
    pub fn unidentified_client() -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY)
    }
}
