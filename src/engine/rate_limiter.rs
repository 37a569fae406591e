//! Sliding-window rate limiting for requests to the remote archive.
//!
//! [`RateLimiter`] admits at most `max_per_period` requests in any trailing
//! window of `period`, and additionally spaces consecutive requests at least
//! `period / max_per_period` apart so a full window is spread out instead of
//! fired as a burst.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use storydredge_core::engine::RateLimiter;
//!
//! # async fn example() {
//! // 10 requests per minute, shared by every worker
//! let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
//!
//! limiter.acquire().await;
//! // ... issue request
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default request budget per period for the archive.
pub const DEFAULT_MAX_PER_PERIOD: u32 = 10;

/// Default window length for the archive budget.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Warning threshold for cumulative delay imposed by the limiter.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Sliding-window rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across Tokio tasks. All window
/// bookkeeping happens behind a single `tokio::sync::Mutex`, so the bound
/// holds for the aggregate of every caller, not per caller.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_period: u32,
    period: Duration,
    disabled: bool,
    state: Mutex<WindowState>,
    /// Total time callers have spent waiting, in milliseconds.
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct WindowState {
    /// Admission instants inside the trailing window, oldest first.
    window: VecDeque<Instant>,
    /// Server-mandated pause (Retry-After) that blocks all admissions.
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn evict_expired(&mut self, now: Instant, period: Duration) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `max_per_period` requests per `period`.
    ///
    /// A `max_per_period` of zero is treated as one.
    #[must_use]
    #[instrument(skip_all, fields(max_per_period, period_ms = period.as_millis()))]
    pub fn new(max_per_period: u32, period: Duration) -> Self {
        let max_per_period = max_per_period.max(1);
        tracing::Span::current().record("max_per_period", max_per_period);
        debug!("creating rate limiter");
        Self {
            max_per_period,
            period,
            disabled: false,
            state: Mutex::new(WindowState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a disabled rate limiter that never waits.
    ///
    /// Use this when `--rate-limit 0` is specified, or for local sources.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            max_per_period: u32::MAX,
            period: Duration::ZERO,
            disabled: true,
            state: Mutex::new(WindowState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn max_per_period(&self) -> u32 {
        self.max_per_period
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Minimum spacing enforced between two consecutive admissions.
    #[must_use]
    pub fn min_spacing(&self) -> Duration {
        if self.disabled {
            Duration::ZERO
        } else {
            self.period / self.max_per_period
        }
    }

    /// Total time callers have been held back so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Waits until one more request fits the budget, then records it.
    ///
    /// Never fails. Waiting callers queue on the internal mutex, so admissions
    /// are granted one at a time in lock order.
    #[instrument(skip(self))]
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        let started = Instant::now();
        let mut state = self.state.lock().await;

        loop {
            let now = Instant::now();

            if let Some(until) = state.blocked_until {
                if until > now {
                    debug!(
                        wait_ms = until.duration_since(now).as_millis(),
                        "honouring server rate limit"
                    );
                    tokio::time::sleep_until(until).await;
                    continue;
                }
                state.blocked_until = None;
            }

            state.evict_expired(now, self.period);

            if state.window.len() >= self.max_per_period as usize {
                if let Some(&oldest) = state.window.front() {
                    let free_at = oldest + self.period;
                    debug!(
                        wait_ms = free_at.duration_since(now).as_millis(),
                        in_window = state.window.len(),
                        "window full, waiting for oldest request to age out"
                    );
                    tokio::time::sleep_until(free_at).await;
                    continue;
                }
            }

            if let Some(&last) = state.window.back() {
                let next_allowed = last + self.min_spacing();
                if next_allowed > now {
                    tokio::time::sleep_until(next_allowed).await;
                    continue;
                }
            }

            state.window.push_back(now);
            break;
        }
        drop(state);

        let waited = started.elapsed();
        if !waited.is_zero() {
            self.add_cumulative_delay(waited);
        }
    }

    /// Records a server-mandated pause (from a Retry-After header).
    ///
    /// No request is admitted until `delay` has elapsed. A shorter pause never
    /// shortens one already in effect.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis()))]
    pub async fn record_rate_limit(&self, delay: Duration) {
        if self.disabled {
            return;
        }
        let until = Instant::now() + delay;
        let mut state = self.state.lock().await;
        state.blocked_until = Some(state.blocked_until.map_or(until, |current| current.max(until)));
        drop(state);

        let cumulative = self.add_cumulative_delay(delay);
        debug!(
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self.cumulative_delay_ms.fetch_add(delay_ms, Ordering::Relaxed) + delay_ms;
        let total = Duration::from_millis(total);
        let previous = total.saturating_sub(Duration::from_millis(delay_ms));
        if previous < CUMULATIVE_DELAY_WARNING_THRESHOLD
            && total >= CUMULATIVE_DELAY_WARNING_THRESHOLD
        {
            warn!(
                cumulative_delay_secs = total.as_secs(),
                "excessive rate limiting - archive may be under heavy load"
            );
        }
        total
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds (`Retry-After: 120`) and HTTP-dates
/// (`Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`). Returns `None` if the value
/// cannot be parsed. Caps excessive values at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use storydredge_core::engine::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => match datetime.duration_since(std::time::SystemTime::now()) {
            Ok(duration) => Some(cap_retry_after(duration)),
            Err(_) => {
                debug!(header_value, "Retry-After date is in the past, returning zero");
                Some(Duration::ZERO)
            }
        },
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Asserts that no window of length `period` holds more than `max` stamps.
    fn assert_window_bound(stamps: &[Instant], max: usize, period: Duration) {
        for (i, first) in stamps.iter().enumerate() {
            if let Some(later) = stamps.get(i + max) {
                assert!(
                    later.duration_since(*first) >= period,
                    "{} requests within {:?} starting at index {i}",
                    max + 1,
                    period
                );
            }
        }
    }

    // ==================== RateLimiter Tests ====================

    #[test]
    fn test_rate_limiter_new_reports_budget() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        assert_eq!(limiter.max_per_period(), 10);
        assert_eq!(limiter.period(), Duration::from_secs(60));
        assert_eq!(limiter.min_spacing(), Duration::from_secs(6));
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_rate_limiter_zero_budget_treated_as_one() {
        let limiter = RateLimiter::new(0, Duration::from_secs(5));
        assert_eq!(limiter.max_per_period(), 1);
        assert_eq!(limiter.min_spacing(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::disabled();
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire().await;
        }

        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(limiter.is_disabled());
    }

    #[tokio::test]
    async fn test_rate_limiter_first_request_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_enforces_min_spacing() {
        tokio::time::pause();

        let limiter = RateLimiter::new(4, Duration::from_secs(8));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_rate_limiter_window_bound_sequential() {
        tokio::time::pause();

        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let mut stamps = Vec::new();
        for _ in 0..23 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }

        assert_window_bound(&stamps, 5, Duration::from_secs(10));
        assert!(limiter.cumulative_delay() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_rate_limiter_window_bound_concurrent_callers() {
        tokio::time::pause();

        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(6)));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            let stamps = Arc::clone(&stamps);
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    limiter.acquire().await;
                    stamps.lock().await.push(Instant::now());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut stamps = stamps.lock().await.clone();
        stamps.sort();
        assert_eq!(stamps.len(), 16);
        assert_window_bound(&stamps, 3, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_rate_limiter_recovers_after_idle_period() {
        tokio::time::pause();

        let limiter = RateLimiter::new(2, Duration::from_secs(4));
        limiter.acquire().await;
        limiter.acquire().await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    // ==================== record_rate_limit Tests ====================

    #[tokio::test]
    async fn test_record_rate_limit_blocks_next_acquire() {
        tokio::time::pause();

        let limiter = RateLimiter::new(100, Duration::from_secs(1));
        limiter.record_rate_limit(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_record_rate_limit_shorter_pause_does_not_shorten() {
        tokio::time::pause();

        let limiter = RateLimiter::new(100, Duration::from_secs(1));
        limiter.record_rate_limit(Duration::from_secs(8)).await;
        limiter.record_rate_limit(Duration::from_secs(1)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_record_rate_limit_ignored_when_disabled() {
        tokio::time::pause();

        let limiter = RateLimiter::disabled();
        limiter.record_rate_limit(Duration::from_secs(30)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_whitespace() {
        assert_eq!(parse_retry_after("  30 "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_negative() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }
}
