//! Retry policy and HTTP failure classification.
//!
//! A failed attempt is either retryable (timeout, transport failure,
//! HTTP 5xx, HTTP 429) or terminal (any other 4xx). Terminal failures
//! short-circuit immediately; retryable ones back off exponentially with
//! no jitter: `base * 2^(n-1)` before attempt `n`.

use reqwest::StatusCode;
use std::time::Duration;

/// Retry/backoff configuration shared by all session-client requests.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first (not "retries after").
    pub max_attempts: u32,
    /// Backoff base; the delay before attempt `n` is `base * 2^(n-1)`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed `attempt` (1-based) before the next
    /// one: base, 2*base, 4*base, ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// True for response statuses worth retrying: server errors and 429.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
