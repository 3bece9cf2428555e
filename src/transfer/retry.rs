//! Fixed-delay retry and HTTP status classification for chunk requests.
//!
//! Two separate mechanisms live here:
//!
//! - [`RetryPolicy`] re-runs a request that failed below the HTTP level
//!   (connection refused, DNS, truncated body). Delays are fixed; there is no
//!   exponential growth and no jitter, because only one request is ever in
//!   flight.
//! - [`classify_status`] maps the status code of a response that *did* arrive
//!   onto the action the engine takes next.
//!
//! # Example
//!
//! ```
//! use crawl_export::transfer::{FatalKind, StatusClass, classify_status};
//!
//! assert_eq!(classify_status(200), StatusClass::Proceed);
//! assert_eq!(classify_status(429), StatusClass::Throttle);
//! assert_eq!(classify_status(504), StatusClass::Shrink);
//! assert_eq!(classify_status(503), StatusClass::Retry);
//! assert_eq!(classify_status(404), StatusClass::Fatal(FatalKind::NotFound));
//! ```

use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::{debug, warn};

use super::constants::{FETCH_RETRY_ATTEMPTS, FETCH_RETRY_DELAY};

/// How long to wait between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStrategy {
    /// The same pause after every failed attempt.
    Fixed(Duration),
    /// Retry immediately. Used by tests to exercise every branch without waiting.
    Immediate,
}

impl DelayStrategy {
    /// Returns the pause before the attempt following `failed_attempt`.
    #[must_use]
    pub fn delay_after(&self, _failed_attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Immediate => Duration::ZERO,
        }
    }
}

/// Decision on whether to run a failed operation again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the operation again after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up and surface the last error.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Attempt budget and delay strategy shared by the probe and every chunk fetch.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `delay`: fixed 10 seconds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    /// Pause between attempts.
    delay: DelayStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: FETCH_RETRY_ATTEMPTS,
            delay: DelayStrategy::Fixed(FETCH_RETRY_DELAY),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given budget (clamped to at least one attempt).
    #[must_use]
    pub fn new(max_attempts: u32, delay: DelayStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the configured delay strategy.
    #[must_use]
    pub fn delay(&self) -> DelayStrategy {
        self.delay
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay.delay_after(attempt),
            attempt: attempt + 1,
        }
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    ///
    /// `on_failure` is invoked once per failed attempt, including the last one,
    /// with the 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt together with the number of
    /// attempts made.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        mut on_failure: impl FnMut(u32, &E),
    ) -> Result<T, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            on_failure(attempt, &error);

            match self.should_retry(attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(
                        attempt,
                        next_attempt = next,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "request failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, %reason, "giving up");
                    return Err((error, attempt));
                }
            }
        }
    }
}

/// Non-recoverable client errors, each with its own user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// 403: the credentials do not grant access to this crawl.
    AccessDenied,
    /// 404: the crawl does not exist.
    NotFound,
    /// Any other 4xx.
    UnknownClientError,
    /// A status outside the 2xx/4xx/5xx classes the API is known to send.
    UnexpectedStatus,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::AccessDenied => "Access denied. Wrong credentials?",
            Self::NotFound => "Not found. Correct crawl ID?",
            Self::UnknownClientError => "Unknown client error occurred",
            Self::UnexpectedStatus => "Unexpected response status",
        };
        f.write_str(message)
    }
}

/// Action the engine takes for a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 200: process the rows.
    Proceed,
    /// 429: pause, then repeat the identical request. Not a timeout.
    Throttle,
    /// 504: count the timeout, shrink the chunk once the threshold is hit, pause, repeat.
    Shrink,
    /// Other 5xx: pause, then repeat the identical request.
    Retry,
    /// Abort the session.
    Fatal(FatalKind),
}

impl StatusClass {
    /// Whether the status aborts the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Status ranges in priority order; the first matching row wins.
const STATUS_TABLE: &[(RangeInclusive<u16>, StatusClass)] = &[
    (200..=200, StatusClass::Proceed),
    (429..=429, StatusClass::Throttle),
    (403..=403, StatusClass::Fatal(FatalKind::AccessDenied)),
    (404..=404, StatusClass::Fatal(FatalKind::NotFound)),
    (400..=499, StatusClass::Fatal(FatalKind::UnknownClientError)),
    (504..=504, StatusClass::Shrink),
    (500..=599, StatusClass::Retry),
];

/// Classifies an HTTP status code by looking it up in the status table.
///
/// | Status | Class |
/// |--------|-------|
/// | 200 | Proceed |
/// | 429 | Throttle |
/// | 403 | Fatal (access denied) |
/// | 404 | Fatal (not found) |
/// | other 4xx | Fatal (unknown client error) |
/// | 504 | Shrink |
/// | other 5xx | Retry |
/// | anything else | Fatal (unexpected status) |
#[must_use]
pub fn classify_status(status: u16) -> StatusClass {
    STATUS_TABLE
        .iter()
        .find(|(range, _)| range.contains(&status))
        .map_or(StatusClass::Fatal(FatalKind::UnexpectedStatus), |(_, class)| {
            *class
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(
            policy.delay(),
            DelayStrategy::Fixed(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::new(0, DelayStrategy::Immediate);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_fixed_delay_does_not_grow() {
        let policy = RetryPolicy::new(5, DelayStrategy::Fixed(Duration::from_secs(10)));
        for attempt in 1..5 {
            assert_eq!(
                policy.should_retry(attempt),
                RetryDecision::Retry {
                    delay: Duration::from_secs(10),
                    attempt: attempt + 1,
                }
            );
        }
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3, DelayStrategy::Immediate);
        assert!(matches!(policy.should_retry(2), RetryDecision::Retry { .. }));
        let decision = policy.should_retry(3);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("exhausted"));
        }
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let policy = RetryPolicy::new(5, DelayStrategy::Immediate);
        let mut calls = 0;
        let mut failures = Vec::new();
        let result: Result<u32, (String, u32)> = policy
            .run(
                || {
                    calls += 1;
                    let current = calls;
                    async move {
                        if current < 3 {
                            Err(format!("boom {current}"))
                        } else {
                            Ok(current)
                        }
                    }
                },
                |attempt, _error: &String| failures.push(attempt),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(failures, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_exhausted_returns_last_error_and_attempt_count() {
        let policy = RetryPolicy::new(5, DelayStrategy::Immediate);
        let mut calls = 0;
        let mut failures = 0;
        let result: Result<(), (String, u32)> = policy
            .run(
                || {
                    calls += 1;
                    let current = calls;
                    async move { Err(format!("boom {current}")) }
                },
                |_, _| failures += 1,
            )
            .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(error, "boom 5");
        assert_eq!(attempts, 5);
        assert_eq!(failures, 5, "every failed attempt is reported");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_fixed_delay_between_attempts() {
        let policy = RetryPolicy::new(3, DelayStrategy::Fixed(Duration::from_secs(10)));
        let started = tokio::time::Instant::now();
        let result: Result<(), (&str, u32)> =
            policy.run(|| async { Err("down") }, |_, _| {}).await;

        assert!(result.is_err());
        // Two pauses between three attempts, none after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(21), "waited {elapsed:?}");
    }

    // ==================== Status Classification Tests ====================

    #[test]
    fn test_classify_200_proceeds() {
        assert_eq!(classify_status(200), StatusClass::Proceed);
    }

    #[test]
    fn test_classify_429_throttles() {
        assert_eq!(classify_status(429), StatusClass::Throttle);
    }

    #[test]
    fn test_classify_403_access_denied() {
        assert_eq!(
            classify_status(403),
            StatusClass::Fatal(FatalKind::AccessDenied)
        );
    }

    #[test]
    fn test_classify_404_not_found() {
        assert_eq!(classify_status(404), StatusClass::Fatal(FatalKind::NotFound));
    }

    #[test]
    fn test_classify_other_4xx_unknown_client_error() {
        for status in [400, 401, 408, 410, 451, 499] {
            assert_eq!(
                classify_status(status),
                StatusClass::Fatal(FatalKind::UnknownClientError),
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_504_shrinks() {
        assert_eq!(classify_status(504), StatusClass::Shrink);
    }

    #[test]
    fn test_classify_other_5xx_retries() {
        for status in [500, 502, 503, 599] {
            assert_eq!(classify_status(status), StatusClass::Retry, "status {status}");
        }
    }

    #[test]
    fn test_classify_unlisted_status_is_fatal() {
        for status in [100, 204, 301, 302, 600] {
            let class = classify_status(status);
            assert_eq!(class, StatusClass::Fatal(FatalKind::UnexpectedStatus));
            assert!(class.is_fatal());
        }
    }

    #[test]
    fn test_fatal_kind_messages() {
        assert_eq!(
            FatalKind::AccessDenied.to_string(),
            "Access denied. Wrong credentials?"
        );
        assert_eq!(
            FatalKind::NotFound.to_string(),
            "Not found. Correct crawl ID?"
        );
    }
}
