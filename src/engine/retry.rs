//! Retry logic with exponential backoff for transient stage failures.
//!
//! Only the network-bound stages (archive fetch and model classification) are
//! wrapped in a [`RetryPolicy`]; the text-processing stages are deterministic
//! and fail the issue on the first error.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use storydredge_core::engine::{FailureType, RetryPolicy};
//!
//! # async fn example() {
//! let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1), 2.0);
//!
//! let result: Result<u32, _> = policy
//!     .run("lookup", || async { Err::<u32, &str>("offline") }, |_| FailureType::Transient)
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), 3);
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (2 seconds).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default maximum delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Jitter ceiling applied when several workers retry against one archive.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx responses, unparseable model output.
    Transient,

    /// The remote side asked us to slow down (HTTP 429).
    RateLimited,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, invalid issue identifier, validation errors.
    Permanent,
}

impl FailureType {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Failure returned by [`RetryPolicy::run`], carrying the last underlying error.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error.
    #[error("{label} failed permanently on attempt {attempt}: {source}")]
    Permanent {
        label: String,
        attempt: u32,
        #[source]
        source: E,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("{label} gave up after {attempts} attempts: {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The error of the final attempt.
    #[must_use]
    pub fn last_error(&self) -> &E {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 2 seconds
/// - `max_delay`: 60 seconds
/// - `backoff_factor`: 2.0
/// - `jitter`: none
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * factor^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are 2s then 4s before attempts run out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    /// Upper bound of the random delay added to each backoff.
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` includes the initial attempt and is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_factor,
            jitter: Duration::ZERO,
        }
    }

    /// Creates a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Adds up to `jitter` of random delay to every backoff.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if !failure_type.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `classify` maps each error to a [`FailureType`]; only transient and
    /// rate-limited failures are retried. Backoff sleeps block the calling task
    /// only.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Permanent`] on the first non-retryable failure and
    /// [`RetryError::Exhausted`] once `max_attempts` retryable failures occurred.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        label: &str,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureType,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let failure_type = classify(&error);
            match self.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    warn!(
                        operation = label,
                        attempt,
                        next_attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis(),
                        ?failure_type,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(operation = label, attempt, reason = %reason, "not retrying");
                    let label = label.to_string();
                    return Err(if failure_type.is_retryable() {
                        RetryError::Exhausted {
                            label,
                            attempts: attempt,
                            source: error,
                        }
                    } else {
                        RetryError::Permanent {
                            label,
                            attempt,
                            source: error,
                        }
                    });
                }
            }
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * self.backoff_factor.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
        )
    }

    // ==================== Policy Configuration Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_retry_policy_zero_attempts_clamped_to_one() {
        assert_eq!(fast_policy(0).max_attempts(), 1);
    }

    #[test]
    fn test_with_max_retries_counts_initial_attempt() {
        assert_eq!(RetryPolicy::with_max_retries(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::with_max_retries(3).max_attempts(), 4);
    }

    #[test]
    fn test_failure_type_retryability() {
        assert!(FailureType::Transient.is_retryable());
        assert!(FailureType::RateLimited.is_retryable());
        assert!(!FailureType::Permanent.is_retryable());
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_calculate_delay_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_delay_jitter_within_bounds() {
        let policy = fast_policy(3).with_jitter(Duration::from_millis(50));
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    // ==================== should_retry Tests ====================

    #[test]
    fn test_should_retry_transient_first_attempt() {
        let decision = fast_policy(3).should_retry(FailureType::Transient, 1);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(100),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_should_retry_permanent_never() {
        let decision = fast_policy(3).should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_exhausted() {
        let decision = fast_policy(3).should_retry(FailureType::RateLimited, 3);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("expected DoNotRetry"),
        }
    }

    // ==================== run Tests ====================

    #[tokio::test]
    async fn test_run_always_retryable_attempts_exactly_max() {
        tokio::time::pause();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = fast_policy(4)
            .run(
                "fetch",
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("timeout") }
                },
                |_| FailureType::Transient,
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(error.is_exhausted());
        assert_eq!(error.attempts(), 4);
        assert_eq!(*error.last_error(), "timeout");
        assert!(error.to_string().contains("gave up after 4 attempts"));
    }

    #[tokio::test]
    async fn test_run_permanent_failure_not_retried() {
        tokio::time::pause();

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run(
                "classify",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("bad request") }
                },
                |_| FailureType::Permanent,
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!error.is_exhausted());
        assert_eq!(error.attempts(), 1);
    }

    #[tokio::test]
    async fn test_run_succeeds_after_transient_failures() {
        tokio::time::pause();

        let calls = AtomicU32::new(0);
        let value = fast_policy(3)
            .run(
                "fetch",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("503") } else { Ok(42) } }
                },
                |_| FailureType::Transient,
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_sleeps_exponential_backoff() {
        tokio::time::pause();

        let start = Instant::now();
        let _ = fast_policy(3)
            .run("fetch", || async { Err::<(), _>("down") }, |_| {
                FailureType::Transient
            })
            .await;

        // 100ms after attempt 1, 200ms after attempt 2
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_run_classification_can_change_between_attempts() {
        tokio::time::pause();

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run(
                "fetch",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), u32>(n) }
                },
                |n| {
                    if *n == 0 {
                        FailureType::RateLimited
                    } else {
                        FailureType::Permanent
                    }
                },
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.attempts(), 2);
        assert_eq!(error.into_last_error(), 1);
    }
}
