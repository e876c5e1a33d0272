//! Error types for autotagger.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using autotagger's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Connection refused, reset, DNS failure and the like
    #[error("AI request failed: {0}")]
    Transport(String),

    #[error("AI request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Non-success HTTP status from the prediction endpoint
    #[error("AI endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response arrived but does not have the expected shape
    #[error("Invalid response format from AI: {0}")]
    Protocol(String),

    /// Image could not be located, fetched or encoded
    #[error("Error fetching image: {0}")]
    Image(String),

    /// e621 tag search failed; never shown as an AI failure
    #[error("Tag search failed: {0}")]
    Autocomplete(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A tag generation is already running for this session
    #[error("Tag generation already in progress")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write config: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
}

impl Error {
    /// Transient transport faults are worth another attempt; shape mismatches are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout(_) => true,
            Error::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Classify a reqwest failure for a request bounded by `timeout`.
    pub(crate) fn from_request(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Error::Timeout(timeout)
        } else {
            Error::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(Error::Transport("connection refused".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(10)).is_retryable());
    }

    #[test]
    fn test_status_retry_classification() {
        let unavailable = Error::Status { status: 503, body: String::new() };
        let throttled = Error::Status { status: 429, body: String::new() };
        let not_found = Error::Status { status: 404, body: String::new() };
        assert!(unavailable.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_shape_and_image_errors_fail_fast() {
        assert!(!Error::Protocol("missing data".into()).is_retryable());
        assert!(!Error::Image("404".into()).is_retryable());
        assert!(!Error::Busy.is_retryable());
    }

    #[test]
    fn test_tag_search_errors_name_the_tag_search() {
        let err = Error::Autocomplete("timed out after 10000ms".into());
        assert_eq!(err.to_string(), "Tag search failed: timed out after 10000ms");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_message_in_millis() {
        let err = Error::Timeout(Duration::from_millis(2500));
        assert_eq!(err.to_string(), "AI request timed out after 2500ms");
    }
}
