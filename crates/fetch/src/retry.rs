use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use deepharvest_core::config::FetchSettings;

/// Exponential backoff with jitter: `base * 2^attempt * uniform(0.5, 1.5)`,
/// capped. 429/503 responses carrying Retry-After override the computed
/// delay when they ask for longer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.retry_base_ms),
            cap: Duration::from_millis(settings.retry_cap_ms),
            max_retries: settings.max_retries,
        }
    }

    /// Statuses that warrant another attempt: 408/425/429 plus all 5xx.
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 425 | 429) || status >= 500
    }

    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let exp = self
            .base
            .mul_f64((1u64 << attempt.min(16)) as f64 * jitter)
            .min(self.cap);
        match retry_after {
            Some(after) => after.max(exp),
            None => exp,
        }
    }
}

/// Retry-After is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.signed_duration_since(Utc::now());
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 425, 429, 500, 502, 503, 599] {
            assert!(RetryPolicy::is_retryable_status(status), "{status}");
        }
        for status in [200, 301, 400, 403, 404, 410, 451] {
            assert!(!RetryPolicy::is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn test_delay_grows_with_jitter_bounds() {
        let policy = policy();
        for attempt in 0..4 {
            let d = policy.delay(attempt, None);
            let nominal = 500u64 << attempt;
            assert!(d >= Duration::from_millis(nominal / 2), "attempt {attempt}");
            assert!(d <= Duration::from_millis(nominal * 3 / 2), "attempt {attempt}");
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert!(policy.delay(16, None) <= Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_takes_precedence_when_longer() {
        let policy = policy();
        let d = policy.delay(0, Some(Duration::from_secs(2)));
        assert!(d >= Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
