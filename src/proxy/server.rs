//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::pipeline::{BodyError, ClientRequest, Downstream, PipelineResponse, RequestPipeline};

/// Default cap on buffered request bodies.
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// HTTP server that puts a [`RequestPipeline`] in front of every route.
pub struct HttpServer<D: Downstream + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared pipeline instance
    pipeline: Arc<RequestPipeline<D>>,
    /// Largest request body accepted
    max_body_bytes: usize,
}

struct AppState<D: Downstream> {
    pipeline: Arc<RequestPipeline<D>>,
    max_body_bytes: usize,
}

impl<D: Downstream> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl<D: Downstream + 'static> HttpServer<D> {
    /// Create a new HTTP server for `pipeline`.
    pub fn new(addr: SocketAddr, pipeline: RequestPipeline<D>) -> Self {
        Self {
            addr,
            pipeline: Arc::new(pipeline),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Limit the size of request bodies buffered before forwarding.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Build the router. Every method and path goes through the pipeline.
    pub fn router(&self) -> Router {
        let state = AppState {
            pipeline: Arc::clone(&self.pipeline),
            max_body_bytes: self.max_body_bytes,
        };
        Router::new()
            .fallback(handle_request::<D>)
            .with_state(state)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn handle_request<D: Downstream + 'static>(
    State(state): State<AppState<D>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let peer_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let request = ClientRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body: Bytes::new(),
        peer_addr,
    };

    // The body is only buffered once the pipeline has admitted the request.
    state
        .pipeline
        .handle_with_body(request, read_body(body, state.max_body_bytes))
        .await
        .response
        .into_response()
}

/// Buffer at most `limit` bytes of `body`.
async fn read_body(body: Body, limit: usize) -> std::result::Result<Bytes, BodyError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Unreadable(e.to_string())),
    }
}

impl IntoResponse for PipelineResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}
