//! Retry policy for storage requests.
//!
//! The dispatcher never retries on its own. Callers ask the policy whether a
//! failed request should be re-issued and after what delay.

use crate::config::RetryConfig;
use std::time::Duration;

/// HTTP status returned when credentials are rejected.
pub const HTTP_AUTH_ERROR: u16 = 403;
/// HTTP status for a missing object.
pub const HTTP_NOT_FOUND: u16 = 404;
/// HTTP status for a failed conditional request (stale ETag).
pub const HTTP_PRECONDITION_FAILED: u16 = 412;
/// HTTP status for an unchanged object on a conditional GET.
pub const HTTP_NOT_MODIFIED: u16 = 304;
/// HTTP status for a request the server timed out waiting for.
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
/// HTTP status for throttling.
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// Explicit retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_auth_retries: u32,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            delays: config
                .delays_ms
                .iter()
                .map(|&ms| Duration::from_millis(ms))
                .collect(),
            max_auth_retries: config.max_auth_retries,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            delays: Vec::new(),
            max_auth_retries: 0,
        }
    }

    /// Maximum number of transient retries.
    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }

    /// Maximum number of re-authentication retries after a 403.
    pub fn max_auth_retries(&self) -> u32 {
        self.max_auth_retries
    }

    /// True if a failure with this status may be retried at all.
    ///
    /// Only server errors, throttling and request timeouts are transient.
    /// `None` is a failure that never reached the server (bad key, bad
    /// configuration, local I/O) and repeating it cannot help.
    pub fn is_retryable(status: Option<u16>) -> bool {
        match status {
            None => false,
            Some(s) => {
                (500..600).contains(&s)
                    || s == HTTP_TOO_MANY_REQUESTS
                    || s == HTTP_REQUEST_TIMEOUT
            }
        }
    }

    /// Delay before retry number `attempt` (zero-based), or `None` if the
    /// request should fail now.
    ///
    /// A `Retry-After` hint raises the delay but never beyond the largest
    /// scheduled delay.
    pub fn next_delay(
        &self,
        attempt: usize,
        status: Option<u16>,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if !Self::is_retryable(status) {
            return None;
        }
        self.delay_for(attempt, retry_after)
    }

    /// Delay before retry number `attempt` of a failure already known to be
    /// transient.
    pub fn delay_for(&self, attempt: usize, retry_after: Option<Duration>) -> Option<Duration> {
        let base = *self.delays.get(attempt)?;
        let cap = self.delays.iter().copied().max().unwrap_or_default();
        Some(match retry_after {
            Some(hint) if hint > base => hint.min(cap),
            _ => base,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..7)
            .map(|i| policy.next_delay(i, Some(503), None))
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_millis(500)),
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(2000)),
                Some(Duration::from_millis(4000)),
                Some(Duration::from_millis(8000)),
                None,
            ]
        );
    }

    #[test]
    fn test_conditional_outcomes_are_not_retried() {
        let policy = RetryPolicy::default();
        for status in [200, 304, 400, 403, 404, 409, 412] {
            assert_eq!(policy.next_delay(0, Some(status), None), None, "{status}");
        }
        for status in [408, 429, 500, 503] {
            assert!(policy.next_delay(0, Some(status), None).is_some(), "{status}");
        }
    }

    #[test]
    fn test_statusless_failures_are_not_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0, None, None), None);
        assert_eq!(policy.delay_for(0, None), Some(Duration::ZERO));
        assert_eq!(policy.delay_for(6, None), None);
    }

    #[test]
    fn test_retry_after_raises_delay_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_delay(1, Some(503), Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            policy.next_delay(1, Some(503), Some(Duration::from_secs(60))),
            Some(Duration::from_millis(8000))
        );
        // A hint shorter than the schedule does not shorten it.
        assert_eq!(
            policy.next_delay(4, Some(503), Some(Duration::from_millis(10))),
            Some(Duration::from_millis(4000))
        );
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.next_delay(0, Some(500), None), None);
    }
}
