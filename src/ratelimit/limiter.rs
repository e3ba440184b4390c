//! Core admission-control decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::client::ClientId;
use super::window::ClientWindowStore;
use crate::config::RateLimitingConfig;

/// A per-client quota: at most `max_requests` admitted requests within any
/// `window`-long span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    max_requests: usize,
    window: Duration,
}

impl Quota {
    /// Create a quota. Returns `None` if either bound is zero, which means
    /// limiting is disabled.
    pub fn new(max_requests: usize, window: Duration) -> Option<Self> {
        if max_requests == 0 || window.is_zero() {
            return None;
        }
        Some(Self { max_requests, window })
    }

    /// Build a quota from the `RequestLimit` / `TimeWindowSeconds` settings.
    ///
    /// Values below 1 disable limiting.
    pub fn from_settings(request_limit: i64, time_window_seconds: i64) -> Option<Self> {
        if request_limit < 1 || time_window_seconds < 1 {
            return None;
        }
        let max_requests = usize::try_from(request_limit).unwrap_or(usize::MAX);
        Self::new(max_requests, Duration::from_secs(time_window_seconds as u64))
    }

    /// Maximum admitted requests per window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Policy for requests whose client cannot be identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingClientPolicy {
    /// Admit without tracking; an unknown client cannot be throttled fairly
    #[default]
    Bypass,
    /// Refuse the request outright
    Reject,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The client already used its quota for the current window
    QuotaExceeded,
    /// No client identifier and the limiter rejects such requests
    MissingClientIdentifier,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Sliding-window rate limiter keyed by client identifier.
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// request history lives in the injected [`ClientWindowStore`].
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<ClientWindowStore>,
    quota: Option<Quota>,
    missing_client: MissingClientPolicy,
}

impl RateLimiter {
    /// Create a limiter over `store`. A `None` quota disables limiting.
    pub fn new(store: Arc<ClientWindowStore>, quota: Option<Quota>) -> Self {
        Self {
            store,
            quota,
            missing_client: MissingClientPolicy::default(),
        }
    }

    /// Build a limiter from the rate limiting configuration section.
    pub fn from_config(config: &RateLimitingConfig, store: Arc<ClientWindowStore>) -> Self {
        let quota = Quota::from_settings(config.request_limit, config.time_window_seconds);
        Self::new(store, quota).with_missing_client_policy(config.missing_client)
    }

    /// Set the policy for requests without a client identifier.
    pub fn with_missing_client_policy(mut self, policy: MissingClientPolicy) -> Self {
        self.missing_client = policy;
        self
    }

    /// Decide whether a request from `client`, arriving at `now`, is admitted.
    ///
    /// An admitted request is recorded in the client's history; a denied one
    /// is not.
    pub fn admit(&self, client: Option<&ClientId>, now: Instant) -> Decision {
        let Some(quota) = self.quota else {
            return Decision::Allow;
        };

        let Some(client) = client else {
            return match self.missing_client {
                MissingClientPolicy::Bypass => Decision::Allow,
                MissingClientPolicy::Reject => Decision::Deny(DenyReason::MissingClientIdentifier),
            };
        };

        let result = self
            .store
            .record(client, now, quota.window, |count| count < quota.max_requests);

        trace!(
            client = %client,
            count = result.count,
            limit = quota.max_requests,
            admitted = result.recorded,
            "Checked rate limit"
        );

        if result.recorded {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::QuotaExceeded)
        }
    }

    /// The active quota, or `None` when limiting is disabled.
    pub fn quota(&self) -> Option<Quota> {
        self.quota
    }

    /// Whether requests are limited at all.
    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    pub fn missing_client_policy(&self) -> MissingClientPolicy {
        self.missing_client
    }

    /// The backing history store.
    pub fn store(&self) -> &Arc<ClientWindowStore> {
        &self.store
    }
}
