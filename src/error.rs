//! Error types for upstream fetches and poll cycles
//!
//! Fetch helpers never decide whether an error is fatal. They return a
//! [`FetchError`] and the daemon loop decides from its kind and the
//! configured policy.

use thiserror::Error;

/// Result type for upstream fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Errors returned by the upstream repository API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection failure, timeout, or an unreadable response body
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream answered with a non-success status code
    #[error("GET {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Response body was not the JSON shape we expect
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }

    /// Whether a later cycle can be expected to succeed.
    ///
    /// Transport failures, rate limiting (403/429) and server errors are
    /// transient. Any other status, such as 404 for an unknown account, and
    /// undecodable payloads will fail the same way every cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || *status == reqwest::StatusCode::FORBIDDEN
            }
            FetchError::Decode { .. } => false,
        }
    }
}

/// Stage of a poll cycle that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    /// Paginated repository listing
    Listing,
    /// Account summary used for the repo counter
    Summary,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::Listing => "listing",
            CycleStage::Summary => "summary",
        }
    }
}

/// A poll cycle aborted because an upstream fetch failed
#[derive(Debug, Error)]
#[error("poll cycle failed during {}: {source}", stage.as_str())]
pub struct CycleError {
    pub stage: CycleStage,
    #[source]
    pub source: FetchError,
}

impl CycleError {
    pub fn listing(source: FetchError) -> Self {
        Self {
            stage: CycleStage::Listing,
            source,
        }
    }

    pub fn summary(source: FetchError) -> Self {
        Self {
            stage: CycleStage::Summary,
            source,
        }
    }
}
