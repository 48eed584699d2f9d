//! Retry loop and rate-limit backpressure.
//!
//! Retries use a deterministic linear backoff (`attempt * base`) and never
//! outlive the ambient deadline or survive cancellation. A shared
//! [`RateLimiter`] adds adaptive spacing when a backend answers 429, so
//! repeated rate limits slow every caller sharing the limiter.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::context::JobContext;
use crate::error::{Result, TranslateError};

/// Per-step retry budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Linear backoff base: delay before retry i is `i * base`
    pub base_delay: Duration,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Rate limiter with backpressure for 429 responses.
///
/// Reservation-based: each caller atomically advances a shared
/// `next_allowed` timestamp to claim its slot, so concurrent callers space
/// out instead of waking together.
pub struct RateLimiter {
    /// Minimum delay between requests in milliseconds
    min_delay_ms: AtomicU64,
    /// Next allowed request timestamp (reservation-based)
    next_allowed_ms: AtomicU64,
    backoff_multiplier: f64,
    max_delay_ms: u64,
    rate_limit_hits: AtomicU32,
}

const RATE_LIMIT_MAX_DELAY_MS: u64 = 30_000;

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            min_delay_ms: AtomicU64::new(0),
            next_allowed_ms: AtomicU64::new(0),
            backoff_multiplier: 2.0,
            max_delay_ms: RATE_LIMIT_MAX_DELAY_MS,
            rate_limit_hits: AtomicU32::new(0),
        }
    }

    /// Wait for our reserved slot before making a request
    pub async fn wait_if_needed(&self) {
        let min_delay = self.min_delay_ms.load(Ordering::Acquire);
        if min_delay == 0 {
            return;
        }

        let now = current_timestamp_ms();
        let my_slot = loop {
            let current_next = self.next_allowed_ms.load(Ordering::Acquire);
            let effective_next = current_next.max(now);
            let new_next = effective_next + min_delay;
            match self.next_allowed_ms.compare_exchange_weak(
                current_next,
                new_next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break effective_next,
                Err(_) => continue,
            }
        };

        let wait_time = my_slot.saturating_sub(now);
        if wait_time > 0 {
            tokio::time::sleep(Duration::from_millis(wait_time)).await;
        }
    }

    /// Gradually reduce the delay after a success
    pub fn record_success(&self) {
        loop {
            let current = self.min_delay_ms.load(Ordering::Acquire);
            if current == 0 {
                return;
            }
            let new_delay = (current as f64 * 0.75) as u64;
            match self.min_delay_ms.compare_exchange_weak(
                current,
                new_delay,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    /// Handle a 429. A server Retry-After hint wins over the multiplicative
    /// backoff.
    pub fn record_rate_limit(&self, retry_after_secs: Option<u64>) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        let new_delay = if let Some(secs) = retry_after_secs {
            (secs * 1000).min(self.max_delay_ms)
        } else {
            let current = self.min_delay_ms.load(Ordering::Acquire).max(100);
            ((current as f64 * self.backoff_multiplier) as u64).min(self.max_delay_ms)
        };
        self.min_delay_ms.store(new_delay, Ordering::Release);
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.min_delay_ms.load(Ordering::Acquire)
    }

    pub fn rate_limit_hits(&self) -> u32 {
        self.rate_limit_hits.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.min_delay_ms.store(0, Ordering::Release);
        self.next_allowed_ms.store(0, Ordering::Release);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Run `operation` with the retry policy, honoring the ambient deadline and
/// cancellation.
///
/// The operation receives the 0-based attempt number. Cancellation aborts
/// immediately and is never retried; a non-retryable error or an exhausted
/// budget returns the last error as-is.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    ctx: &JobContext,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut last_error: Option<TranslateError> = None;

    for attempt in 0..attempts {
        if ctx.cancellation().is_cancelled() {
            return Err(TranslateError::cancelled());
        }
        if ctx.remaining() == Some(Duration::ZERO) {
            return Err(last_error.unwrap_or_else(TranslateError::deadline_exceeded));
        }

        limiter.wait_if_needed().await;

        match operation(attempt).await {
            Ok(value) => {
                limiter.record_success();
                return Ok(value);
            }
            Err(e) => {
                if e.is_cancellation() {
                    return Err(e);
                }
                if matches!(e.kind(), crate::error::ErrorKind::RateLimit) {
                    limiter.record_rate_limit(e.retry_after_secs());
                }
                let retryable = e.is_retryable();
                debug!(attempt, retryable, error = %e, "attempt failed");
                if !retryable || attempt + 1 == attempts {
                    return Err(e);
                }
                last_error = Some(e);

                // Linear backoff: i * base for retry i, clipped to whatever
                // is left of the ambient deadline.
                let delay = policy.base_delay * (attempt + 1);
                let delay = ctx.clip(delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancellation().cancelled() => {
                        return Err(TranslateError::cancelled());
                    }
                }
            }
        }
    }

    warn!("retry budget exhausted");
    Err(last_error.unwrap_or_else(|| TranslateError::unknown("retry budget exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    fn ctx() -> JobContext {
        JobContext::new("en", "zh")
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(&fast_policy(3), &RateLimiter::new(), &ctx(), |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TranslateError>("ok")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_on_429_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(&fast_policy(3), &RateLimiter::new(), &ctx(), |_| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TranslateError::rate_limited(None))
                } else {
                    Ok("ok".to_string())
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_attempts_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&fast_policy(3), &RateLimiter::new(), &ctx(), |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TranslateError::llm("HTTP 400 Bad Request"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_probes_attempt_at_least_twice() {
        for probe in ["i/o timeout", "connection reset by peer", "HTTP 503"] {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let _ = retry(&fast_policy(1), &RateLimiter::new(), &ctx(), |_| {
                let counter = Arc::clone(&counter);
                let probe = probe.to_string();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TranslateError::llm(probe))
                }
            })
            .await;
            assert_eq!(calls.load(Ordering::SeqCst), 2, "probe {probe}");
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let result: Result<()> = retry(&fast_policy(2), &RateLimiter::new(), &ctx(), |_| async {
            Err(TranslateError::timeout("slow upstream"))
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("slow upstream"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_without_retry() {
        let job = ctx();
        job.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&fast_policy(3), &RateLimiter::new(), &job, |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TranslateError::timeout("x"))
            }
        })
        .await;
        assert!(result.unwrap_err().is_cancellation());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_prevents_further_attempts() {
        let job = ctx().with_deadline(Duration::from_millis(20));
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(15),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&policy, &RateLimiter::new(), &job, |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TranslateError::timeout("transient"))
            }
        })
        .await;
        assert!(result.is_err());
        // Far fewer than the 11 budgeted attempts fit in 20ms of deadline
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_rate_limiter_backoff_growth() {
        let rl = RateLimiter::new();
        assert_eq!(rl.current_delay_ms(), 0);
        rl.record_rate_limit(None);
        let first = rl.current_delay_ms();
        assert!(first >= 100);
        rl.record_rate_limit(None);
        assert!(rl.current_delay_ms() > first);
        assert_eq!(rl.rate_limit_hits(), 2);
    }

    #[test]
    fn test_rate_limiter_retry_after_wins() {
        let rl = RateLimiter::new();
        rl.record_rate_limit(Some(5));
        assert_eq!(rl.current_delay_ms(), 5000);
        // Capped at the maximum
        rl.record_rate_limit(Some(600));
        assert_eq!(rl.current_delay_ms(), RATE_LIMIT_MAX_DELAY_MS);
    }

    #[test]
    fn test_rate_limiter_success_decay_and_reset() {
        let rl = RateLimiter::new();
        rl.record_rate_limit(Some(10));
        rl.record_success();
        assert!(rl.current_delay_ms() < 10_000);
        rl.reset();
        assert_eq!(rl.current_delay_ms(), 0);
    }
}
