//! Request outcome classification and the per-request log record.

use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use http::{Method, StatusCode};
use tracing::{error, info, warn};

use super::request::ClientRequest;
use crate::ratelimit::ClientId;

/// Shown in log records when a request has no client identifier.
const UNKNOWN_CLIENT: &str = "unknown";

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The downstream handler produced a response
    Served { status: StatusCode, elapsed: Duration },
    /// The downstream handler returned an error or panicked
    Faulted {
        status: StatusCode,
        elapsed: Duration,
        reason: String,
    },
    /// The request was admitted but its body could not be read
    BodyRejected {
        status: StatusCode,
        elapsed: Duration,
        reason: String,
    },
    /// The client was over quota
    RejectedByQuota,
    /// The request had no client identifier and such requests are rejected
    RejectedNoIdentifier,
    /// The request was dropped before it completed
    Aborted { elapsed: Duration },
}

impl RequestOutcome {
    /// Status sent to the client, if one was sent.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestOutcome::Served { status, .. }
            | RequestOutcome::Faulted { status, .. }
            | RequestOutcome::BodyRejected { status, .. } => Some(*status),
            RequestOutcome::RejectedByQuota => Some(StatusCode::TOO_MANY_REQUESTS),
            RequestOutcome::RejectedNoIdentifier => Some(StatusCode::UNPROCESSABLE_ENTITY),
            RequestOutcome::Aborted { .. } => None,
        }
    }

    /// Whether the downstream handler was skipped.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RequestOutcome::BodyRejected { .. }
                | RequestOutcome::RejectedByQuota
                | RequestOutcome::RejectedNoIdentifier
        )
    }
}

/// What gets logged about a request, captured when it arrives.
#[derive(Debug)]
struct RequestRecord {
    method: Method,
    path: String,
    client: Option<ClientId>,
    received_at: DateTime<Utc>,
    started: Instant,
}

impl RequestRecord {
    fn client(&self) -> &str {
        self.client
            .as_ref()
            .map(ClientId::as_str)
            .unwrap_or(UNKNOWN_CLIENT)
    }

    fn emit(&self, outcome: &RequestOutcome) {
        let timestamp = self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true);

        match outcome {
            RequestOutcome::Served { status, elapsed } => {
                info!(
                    timestamp = %timestamp,
                    method = %self.method,
                    path = %self.path,
                    client = %self.client(),
                    status = status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
            }
            RequestOutcome::Faulted {
                status,
                elapsed,
                reason,
            } => {
                error!(
                    timestamp = %timestamp,
                    method = %self.method,
                    path = %self.path,
                    client = %self.client(),
                    status = status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = %reason,
                    "downstream handler failed"
                );
            }
            RequestOutcome::BodyRejected {
                status,
                elapsed,
                reason,
            } => {
                warn!(
                    timestamp = %timestamp,
                    method = %self.method,
                    path = %self.path,
                    client = %self.client(),
                    status = status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = %reason,
                    "request body rejected"
                );
            }
            RequestOutcome::RejectedByQuota => {
                error!(
                    method = %self.method,
                    path = %self.path,
                    client = %self.client(),
                    "blocked: too many requests"
                );
            }
            RequestOutcome::RejectedNoIdentifier => {
                error!(
                    method = %self.method,
                    path = %self.path,
                    "blocked: no client identifier"
                );
            }
            RequestOutcome::Aborted { elapsed } => {
                warn!(
                    method = %self.method,
                    path = %self.path,
                    client = %self.client(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request aborted before completion"
                );
            }
        }
    }
}

/// Emits exactly one log record for a request.
///
/// [`finish`](Self::finish) logs the given outcome. If the guard is dropped
/// without finishing (the request future was cancelled), it logs
/// [`RequestOutcome::Aborted`] instead.
#[derive(Debug)]
pub(crate) struct OutcomeLog {
    record: RequestRecord,
    emitted: bool,
}

impl OutcomeLog {
    pub(crate) fn start(request: &ClientRequest, client: Option<ClientId>, started: Instant) -> Self {
        Self {
            record: RequestRecord {
                method: request.method.clone(),
                path: request.path().to_string(),
                client,
                received_at: Utc::now(),
                started,
            },
            emitted: false,
        }
    }

    pub(crate) fn finish(mut self, outcome: &RequestOutcome) {
        self.record.emit(outcome);
        self.emitted = true;
    }
}

impl Drop for OutcomeLog {
    fn drop(&mut self) {
        if !self.emitted {
            let elapsed = self.record.started.elapsed();
            self.record.emit(&RequestOutcome::Aborted { elapsed });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    #[test]
    fn test_outcome_status() {
        let served = RequestOutcome::Served {
            status: StatusCode::CREATED,
            elapsed: Duration::from_millis(3),
        };
        assert_eq!(served.status(), Some(StatusCode::CREATED));
        assert!(!served.is_rejection());

        assert_eq!(
            RequestOutcome::RejectedByQuota.status(),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
        assert!(RequestOutcome::RejectedNoIdentifier.is_rejection());

        let body_rejected = RequestOutcome::BodyRejected {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            elapsed: Duration::ZERO,
            reason: "request body exceeds 16 bytes".into(),
        };
        assert_eq!(body_rejected.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert!(body_rejected.is_rejection());
        assert_eq!(
            RequestOutcome::Aborted {
                elapsed: Duration::ZERO
            }
            .status(),
            None
        );
    }

    #[test]
    fn test_record_captures_request_fields() {
        let request = ClientRequest::new(Method::POST, Uri::from_static("/items?x=1"));
        let log = OutcomeLog::start(&request, None, Instant::now());

        assert_eq!(log.record.method, Method::POST);
        assert_eq!(log.record.path, "/items");
        assert_eq!(log.record.client(), UNKNOWN_CLIENT);

        log.finish(&RequestOutcome::RejectedNoIdentifier);
    }
}
