//! Error taxonomy for the admission and scheduling pipeline.

use std::time::Duration;
use thiserror::Error;

/// A single error kind, one variant per row of the taxonomy this crate implements.
///
/// Errors are value-like: each variant carries the fields needed for diagnosis
/// (model id, file path, requested/allowed counts, HTTP status, inner cause)
/// rather than relying on a caller re-deriving context from a string.
#[derive(Debug, Error)]
pub enum Error {
    /// Argument check failed: empty string, negative count, unknown priority, and so on.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Transport returned 401 or 403.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Registry has no entry for the id, or the entry's kind doesn't match the operation.
    #[error("invalid model {model}: {reason}")]
    InvalidModel {
        /// The model id that was looked up.
        model: String,
        /// Why the lookup failed (not found, or wrong kind for this operation).
        reason: String,
    },

    /// A message in the sequence was malformed (empty content, unknown role, ...).
    #[error("malformed message at index {index}: {reason}")]
    MessageFormat {
        /// Index of the offending message.
        index: usize,
        /// Human-readable reason.
        reason: String,
    },

    /// File extension is not one of the accepted audio formats.
    #[error("unsupported audio format {format:?}, expected one of {supported:?}")]
    UnsupportedFormat {
        /// The rejected extension.
        format: String,
        /// The accepted extension set.
        supported: Vec<String>,
    },

    /// File exceeds the plan's size cap.
    #[error("file size {size} bytes exceeds the {max} byte limit for this plan")]
    FileSize {
        /// Size of the rejected file, in bytes.
        size: u64,
        /// Maximum size allowed, in bytes.
        max: u64,
    },

    /// File failed a non-size audio precondition (unreadable, zero estimated duration, ...).
    #[error("audio file error: {0}")]
    AudioFile(String),

    /// Counted (plus declared max) tokens would exceed the model's context window.
    #[error("token limit exceeded: requested {requested}, max {max}")]
    TokenLimitExceeded {
        /// Tokens that would have been consumed.
        requested: usize,
        /// The model's context window.
        max: usize,
    },

    /// The tracker's computed wait exceeded the hard cap; the caller must not sleep.
    #[error("rate limit wait of {wait:?} exceeds the hard cap")]
    RateLimitExceeded {
        /// The wait duration that was rejected.
        wait: Duration,
    },

    /// A transport call did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Transport-level failure below the HTTP layer (connection reset, DNS, TLS, ...).
    #[error("network error: {0}")]
    Network(String),

    /// The queue retried an item past `max_retries`.
    #[error("retry exhausted after {retries} attempts: {cause}")]
    RetryExhausted {
        /// Number of attempts made, including the original.
        retries: u32,
        /// The error from the last attempt.
        cause: Box<Error>,
    },

    /// Enqueue was rejected because the queue was already at capacity.
    #[error("queue full: {size}/{max}")]
    QueueFull {
        /// Live item count at the time of rejection.
        size: usize,
        /// Configured hard cap.
        max: usize,
    },

    /// Server responded 2xx with a body that failed to decode as JSON.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Any other non-2xx response.
    #[error("api error HTTP_{status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Server-supplied `error.message`, if present.
        message: String,
    },
}

impl Error {
    /// Whether the queue's retry policy should reinsert the item after this failure,
    /// per the §7 Policy column: network and timeout errors are retryable; everything
    /// else is surfaced directly to the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::RequestTimeout(_))
    }
}

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::RequestTimeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn validation_and_terminal_errors_are_not_retryable() {
        assert!(!Error::Validation("empty".into()).is_retryable());
        assert!(!Error::QueueFull { size: 2, max: 2 }.is_retryable());
        assert!(!Error::RateLimitExceeded {
            wait: Duration::from_secs(400)
        }
        .is_retryable());
        let cause = Box::new(Error::Network("boom".into()));
        assert!(!Error::RetryExhausted { retries: 3, cause }.is_retryable());
    }
}
