//! Request pipeline: admission check, downstream invocation and logging.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future;
use futures::FutureExt;
use http::StatusCode;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::downstream::Downstream;
use super::outcome::{OutcomeLog, RequestOutcome};
use super::request::{BodyError, ClientRequest, PipelineResponse};
use crate::ratelimit::{Decision, DenyReason, RateLimiter};

/// The response for a request together with how it was classified.
#[derive(Debug, Clone)]
pub struct Handled {
    pub response: PipelineResponse,
    pub outcome: RequestOutcome,
}

/// Runs every request through admission control and the downstream handler,
/// logging one record per request.
pub struct RequestPipeline<D: Downstream> {
    limiter: Arc<RateLimiter>,
    downstream: Arc<D>,
}

impl<D: Downstream> Clone for RequestPipeline<D> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            downstream: Arc::clone(&self.downstream),
        }
    }
}

impl<D: Downstream> RequestPipeline<D> {
    /// Create a new pipeline in front of `downstream`.
    pub fn new(limiter: Arc<RateLimiter>, downstream: Arc<D>) -> Self {
        Self { limiter, downstream }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handle a single request.
    ///
    /// Exactly one log record is emitted per call, including when the
    /// returned future is dropped before it completes.
    pub async fn handle(&self, request: ClientRequest) -> Handled {
        let body = request.body.clone();
        self.handle_with_body(request, future::ready(Ok::<_, BodyError>(body)))
            .await
    }

    /// Handle a request whose body is read only after it has been admitted.
    ///
    /// `body` replaces `request.body` and is never polled for rejected
    /// requests, so an over-quota client does not get to upload.
    pub async fn handle_with_body<B>(&self, request: ClientRequest, body: B) -> Handled
    where
        B: Future<Output = std::result::Result<Bytes, BodyError>> + Send,
    {
        let span = info_span!("request", request_id = %Uuid::new_v4());
        self.process(request, body).instrument(span).await
    }

    async fn process<B>(&self, mut request: ClientRequest, body: B) -> Handled
    where
        B: Future<Output = std::result::Result<Bytes, BodyError>> + Send,
    {
        let started = Instant::now();
        let client = request.client_id();
        let log = OutcomeLog::start(&request, client.clone(), started);

        // The store lock is released once admit returns; nothing below holds it.
        let rejection = match self.limiter.admit(client.as_ref(), started) {
            Decision::Allow => None,
            Decision::Deny(DenyReason::QuotaExceeded) => Some((
                PipelineResponse::too_many_requests(),
                RequestOutcome::RejectedByQuota,
            )),
            Decision::Deny(DenyReason::MissingClientIdentifier) => Some((
                PipelineResponse::unidentified_client(),
                RequestOutcome::RejectedNoIdentifier,
            )),
        };
        if let Some((response, outcome)) = rejection {
            log.finish(&outcome);
            return Handled { response, outcome };
        }

        request.body = match body.await {
            Ok(body) => body,
            Err(err) => {
                let status = err.status();
                let reason = err.to_string();
                let response = PipelineResponse::text(status, reason.clone());
                let outcome = RequestOutcome::BodyRejected {
                    status,
                    elapsed: started.elapsed(),
                    reason,
                };
                log.finish(&outcome);
                return Handled { response, outcome };
            }
        };

        let result = AssertUnwindSafe(self.downstream.call(&request))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let (response, outcome) = match result {
            Ok(Ok(response)) => {
                let outcome = RequestOutcome::Served {
                    status: response.status,
                    elapsed,
                };
                (response, outcome)
            }
            Ok(Err(err)) => {
                let status = err.status();
                let reason = err.to_string();
                let response = PipelineResponse::text(status, reason.clone());
                (response, RequestOutcome::Faulted { status, elapsed, reason })
            }
            Err(panic) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let response = PipelineResponse::text(status, "Internal Server Error");
                let reason = format!("downstream handler panicked: {}", panic_message(&*panic));
                (response, RequestOutcome::Faulted { status, elapsed, reason })
            }
        };

        log.finish(&outcome);
        Handled { response, outcome }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
