//! Typed provider errors.
//!
//! The HTTP layer is the only place that builds a `FetchError`, and it
//! always fills the structured `status` field when the provider answered.
//! Everything downstream (retry eligibility, deferral, cache handling)
//! branches on `status()` / `class()`, never on message text.

use thiserror::Error;

use crate::budget::DenyReason;

/// Coarse failure taxonomy used by the ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 5xx, timeout, connection failure: retry, then leave the cache alone.
    Transient,
    /// 429: budget-tracked, deferred, loop backs off.
    RateLimited,
    /// Other 4xx or an unusable body: fail fast, record "polled, no data".
    NonRetryable,
    /// The local budget refused the call; nothing was sent.
    Blocked,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{endpoint}: provider returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{endpoint}: request timed out")]
    Timeout { endpoint: String },

    #[error("{endpoint}: transport error: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint}: malformed payload: {message}")]
    Decode { endpoint: String, message: String },

    #[error("{endpoint}: blocked by local budget ({reason})")]
    Blocked { endpoint: String, reason: DenyReason },
}

impl FetchError {
    /// HTTP status, when the provider answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            FetchError::Status { endpoint, .. }
            | FetchError::Timeout { endpoint }
            | FetchError::Transport { endpoint, .. }
            | FetchError::Decode { endpoint, .. }
            | FetchError::Blocked { endpoint, .. } => endpoint,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Status { status: 429, .. } => ErrorClass::RateLimited,
            FetchError::Status { status, .. } if *status >= 500 => ErrorClass::Transient,
            FetchError::Status { .. } => ErrorClass::NonRetryable,
            FetchError::Timeout { .. } | FetchError::Transport { .. } => ErrorClass::Transient,
            FetchError::Decode { .. } => ErrorClass::NonRetryable,
            FetchError::Blocked { .. } => ErrorClass::Blocked,
        }
    }

    /// Short label for the quota log `outcome` column.
    pub fn outcome_label(&self) -> &'static str {
        match self.class() {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::NonRetryable => "non_retryable",
            ErrorClass::Blocked => "blocked",
        }
    }

    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { endpoint: endpoint.into() }
        } else if err.is_decode() {
            FetchError::Decode {
                endpoint: endpoint.into(),
                message: err.to_string(),
            }
        } else {
            FetchError::Transport {
                endpoint: endpoint.into(),
                message: err.to_string(),
            }
        }
    }
}
