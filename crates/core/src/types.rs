use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ErrorKind;

/// How a page was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Http,
    Browser,
}

impl FetchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchMode::Http => "http",
            FetchMode::Browser => "browser",
        }
    }
}

/// A frontier entry. The URL is always in canonical form; two records with
/// the same canonical form never coexist in the frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: Url,
    pub host: String,
    pub depth: u32,
    pub priority: f64,
    pub parent: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Earliest time this record may be dispatched (set on retry re-admission).
    pub not_before: Option<DateTime<Utc>>,
}

impl UrlRecord {
    pub fn seed(url: Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_string();
        Self {
            url,
            host,
            depth: 0,
            priority: 1.0,
            parent: None,
            discovered_at: Utc::now(),
            retry_count: 0,
            not_before: None,
        }
    }

    pub fn child(url: Url, parent: &UrlRecord, priority: f64) -> Self {
        let host = url.host_str().unwrap_or_default().to_string();
        Self {
            url,
            host,
            depth: parent.depth + 1,
            priority,
            parent: Some(parent.url.to_string()),
            discovered_at: Utc::now(),
            retry_count: 0,
            not_before: None,
        }
    }
}

/// Response body, in memory or spilled to disk for large responses.
#[derive(Debug)]
pub enum Body {
    Bytes(Vec<u8>),
    Spooled { path: PathBuf, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Bytes(b) => b.len() as u64,
            Body::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            Body::Spooled { .. } => None,
        }
    }

    /// Load the full body, reading the spool file if necessary.
    pub fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Body::Bytes(b) => Ok(b.clone()),
            Body::Spooled { path, .. } => std::fs::read(path),
        }
    }
}

/// Outcome of one fetch. Exactly one of `body` / `error` is populated;
/// the constructors below are the only way these are built.
#[derive(Debug)]
pub struct FetchResult {
    pub url: Url,
    pub final_url: Url,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    pub mime: Option<String>,
    pub duration: Duration,
    pub mode: FetchMode,
    pub screenshot: Option<Vec<u8>>,
    pub error: Option<ErrorKind>,
    pub error_detail: Option<String>,
    /// Transient-failure attempts absorbed before this outcome.
    pub retries: u32,
    pub fetched_at: DateTime<Utc>,
}

impl FetchResult {
    pub fn success(
        url: Url,
        final_url: Url,
        status: u16,
        headers: HashMap<String, String>,
        body: Body,
        mime: Option<String>,
        duration: Duration,
        mode: FetchMode,
    ) -> Self {
        Self {
            url,
            final_url,
            status: Some(status),
            headers,
            body: Some(body),
            mime,
            duration,
            mode,
            screenshot: None,
            error: None,
            error_detail: None,
            retries: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn failure(
        url: Url,
        kind: ErrorKind,
        detail: String,
        status: Option<u16>,
        duration: Duration,
        mode: FetchMode,
    ) -> Self {
        Self {
            final_url: url.clone(),
            url,
            status,
            headers: HashMap::new(),
            body: None,
            mime: None,
            duration,
            mode,
            screenshot: None,
            error: Some(kind),
            error_detail: Some(detail),
            retries: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Content fingerprint, computed once per successful fetch. All three values
/// are deterministic functions of the body bytes and extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub sha256: [u8; 32],
    pub simhash: u64,
    pub minhash: Vec<u32>,
}

impl Fingerprint {
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// A link lifted out of a page, before normalization and admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub url: String,
    pub anchor_text: Option<String>,
    pub is_external: bool,
}

/// Record handed downstream after a page is fetched and classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub mime: Option<String>,
    pub title: Option<String>,
    pub depth: u32,
    pub text_len: usize,
    pub link_count: usize,
    pub sha256: String,
    pub simhash: u64,
    pub duplicate_of: Option<String>,
    pub near_duplicate_of: Option<String>,
    pub mode: FetchMode,
    pub duration_ms: u64,
    pub fetched_at: DateTime<Utc>,
}

/// How a leased URL finished, reported back to the frontier. Transient
/// failures retry inside the fetch pipeline; a lease that never completes
/// is re-admitted through lease expiry, so both outcomes here are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Success,
    /// Terminal failure. The URL stays visited so it is never re-admitted.
    Failure(ErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_result_populates_exactly_one_side() {
        let url = Url::parse("http://example.com/").unwrap();
        let ok = FetchResult::success(
            url.clone(),
            url.clone(),
            200,
            HashMap::new(),
            Body::Bytes(b"hello".to_vec()),
            Some("text/html".into()),
            Duration::from_millis(10),
            FetchMode::Http,
        );
        assert!(ok.body.is_some() && ok.error.is_none());

        let err = FetchResult::failure(
            url,
            ErrorKind::Timeout,
            "read timed out".into(),
            None,
            Duration::from_secs(30),
            FetchMode::Http,
        );
        assert!(err.body.is_none() && err.error.is_some());
        assert!(!err.is_success());
    }

    #[test]
    fn test_child_record_inherits_depth_and_parent() {
        let seed = UrlRecord::seed(Url::parse("http://example.com/").unwrap());
        let child = UrlRecord::child(
            Url::parse("http://example.com/a").unwrap(),
            &seed,
            0.5,
        );
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent.as_deref(), Some("http://example.com/"));
        assert_eq!(child.host, "example.com");
    }
}
