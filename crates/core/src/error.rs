use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy. Every terminal fetch failure is tagged with exactly one
/// kind; retry decisions for HTTP statuses are made where the status is known
/// (408/425/429 are client errors that still retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTransient,
    NetworkPermanent,
    HttpClientError,
    HttpServerError,
    ParseError,
    EncodingError,
    Timeout,
    TooLarge,
    DisallowedByPolicy,
    TrapDetected,
    Cancelled,
    StoreError,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::HttpServerError | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::NetworkPermanent => "network_permanent",
            ErrorKind::HttpClientError => "http_client_error",
            ErrorKind::HttpServerError => "http_server_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::EncodingError => "encoding_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::DisallowedByPolicy => "disallowed_by_policy",
            ErrorKind::TrapDetected => "trap_detected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StoreError => "store_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("permanent network error: {0}")]
    NetworkPermanent(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: u64, max: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("disallowed by policy: {0}")]
    Policy(String),

    #[error("trap detected: {0}")]
    Trap(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Network(_) => ErrorKind::NetworkTransient,
            CrawlError::NetworkPermanent(_) => ErrorKind::NetworkPermanent,
            CrawlError::HttpStatus(status) => {
                if *status >= 500 {
                    ErrorKind::HttpServerError
                } else {
                    ErrorKind::HttpClientError
                }
            }
            CrawlError::Timeout(_) => ErrorKind::Timeout,
            CrawlError::BodyTooLarge { .. } => ErrorKind::TooLarge,
            CrawlError::Parse(_) => ErrorKind::ParseError,
            CrawlError::Encoding(_) => ErrorKind::EncodingError,
            CrawlError::Policy(_) => ErrorKind::DisallowedByPolicy,
            CrawlError::Trap(_) => ErrorKind::TrapDetected,
            CrawlError::Cancelled => ErrorKind::Cancelled,
            CrawlError::Store(_) => ErrorKind::StoreError,
            CrawlError::InvalidUrl(_) | CrawlError::Config(_) => ErrorKind::DisallowedByPolicy,
            CrawlError::Other(_) => ErrorKind::NetworkTransient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::NetworkTransient.is_retryable());
        assert!(ErrorKind::HttpServerError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::HttpClientError.is_retryable());
        assert!(!ErrorKind::TrapDetected.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_maps_to_kind() {
        assert_eq!(CrawlError::HttpStatus(503).kind(), ErrorKind::HttpServerError);
        assert_eq!(CrawlError::HttpStatus(404).kind(), ErrorKind::HttpClientError);
        assert_eq!(CrawlError::HttpStatus(429).kind(), ErrorKind::HttpClientError);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::DisallowedByPolicy).unwrap();
        assert_eq!(s, "\"disallowed_by_policy\"");
    }
}
