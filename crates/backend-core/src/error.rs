use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SyncLifecycleState;

/// Broad error category used for retry, cooldown and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Access token expired or was rejected.
    Auth,
    /// Membership problem in a conversation; treated as "no data".
    Forbidden,
    /// Transient network or transport failure, including timeouts.
    Network,
    /// Rate-limited by the homeserver or throttled locally.
    RateLimited,
    /// A single wire event could not be decoded.
    Malformed,
    /// Durable cache or credential store failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SyncLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while sync is in state {current:?}"),
        )
    }

    /// Synthesized result for a request short-circuited by the rate limiter.
    pub fn throttled_locally(endpoint: impl Into<String>, remaining: Duration) -> Self {
        let endpoint = endpoint.into();
        Self::new(
            BackendErrorCategory::RateLimited,
            "throttled_locally",
            format!("request to '{endpoint}' suppressed during cooldown"),
        )
        .with_retry_after(remaining)
    }

    /// Synthesized result for any request while the whole transport cools down.
    pub fn global_cooldown(endpoint: impl Into<String>, remaining: Duration) -> Self {
        let endpoint = endpoint.into();
        Self::new(
            BackendErrorCategory::RateLimited,
            "global_cooldown",
            format!("request to '{endpoint}' suppressed by global cooldown"),
        )
        .with_retry_after(remaining)
    }

    /// A call exceeded its ceiling.
    pub fn timeout(endpoint: impl Into<String>, ceiling: Duration) -> Self {
        let endpoint = endpoint.into();
        Self::new(
            BackendErrorCategory::Network,
            "request_timeout",
            format!(
                "request to '{endpoint}' timed out after {}ms",
                ceiling.as_millis()
            ),
        )
    }

    /// Whether the next scheduled cycle may succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            BackendErrorCategory::Network | BackendErrorCategory::RateLimited
        )
    }

    /// Whether the error was produced locally without reaching the network.
    pub fn is_synthesized(&self) -> bool {
        self.code == "throttled_locally" || self.code == "global_cooldown"
    }
}

/// Map HTTP status codes to backend error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 => BackendErrorCategory::Auth,
        403 => BackendErrorCategory::Forbidden,
        429 => BackendErrorCategory::RateLimited,
        408 => BackendErrorCategory::Network,
        400..=499 => BackendErrorCategory::Config,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}
