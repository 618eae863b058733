//! Retry engine: repeated attempts of a caller-supplied operation with capped
//! exponential backoff. Whether an error is worth another attempt is decided only
//! by [`searchpipe_core::should_retry`].

use searchpipe_core::{should_retry, ApiError, ErrorKind, Result};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Jitter spread applied around the computed delay (±25%).
pub const JITTER_FRACTION: f64 = 0.25;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Called on every transition into backoff. Errors and panics are logged and dropped.
pub type RetryObserver = Arc<dyn Fn(&RetryAttempt) -> std::result::Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Error codes to retry even when their kind is not retryable.
    pub retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter: true,
            retryable_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// `min(initial * factor^(attempt-1), max_delay)`, whole milliseconds, no jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exp);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(capped.round() as u64)
    }

    /// Delay actually slept after `attempt` failed with `err`.
    pub fn delay_for(&self, attempt: u32, err: &ApiError) -> Duration {
        let mut delay = self.backoff_delay(attempt);
        if self.jitter {
            delay = apply_jitter(delay, JITTER_FRACTION);
        }
        // Waiting less than the advertised reset only burns an attempt.
        if let ErrorKind::RateLimited {
            reset_at_epoch_s: Some(reset),
        } = err.kind
        {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64;
            let until_reset = Duration::from_millis(reset.saturating_mul(1000).saturating_sub(now_ms));
            delay = delay.max(until_reset).min(self.max_delay);
        }
        delay
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    use rand::Rng;
    let spread = rand::rng().random_range(-fraction..=fraction);
    let ms = (delay.as_millis() as f64 * (1.0 + spread)).max(0.0);
    Duration::from_millis(ms.round() as u64)
}

/// Emitted each time a failed attempt is followed by a backoff.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: ApiError,
    pub delay: Duration,
    pub elapsed: Duration,
}

/// Per-logical-call state; lives exactly as long as one `retry` invocation.
#[derive(Debug)]
pub struct RetryContext {
    pub attempt: u32,
    pub started_at: Instant,
    pub last_error: Option<ApiError>,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempt: 1,
            started_at: Instant::now(),
            last_error: None,
        }
    }
}

fn notify(observer: Option<&RetryObserver>, ev: &RetryAttempt) {
    let Some(obs) = observer else { return };
    match catch_unwind(AssertUnwindSafe(|| obs(ev))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, attempt = ev.attempt, "retry observer failed"),
        Err(_) => tracing::warn!(attempt = ev.attempt, "retry observer panicked"),
    }
}

/// Drive `op` until it succeeds, a non-retryable error occurs, or attempts run out.
///
/// `op` receives the 1-based attempt number. On failure the *last* error is returned
/// as-is (never wrapped).
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    observer: Option<&RetryObserver>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut ctx = RetryContext::new();
    loop {
        let err = match op(ctx.attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if ctx.attempt >= max_attempts || !should_retry(&err, &policy.retryable_codes) {
            tracing::debug!(
                attempt = ctx.attempt,
                code = err.code(),
                elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
                "giving up"
            );
            return Err(err);
        }

        let delay = policy.delay_for(ctx.attempt, &err);
        let ev = RetryAttempt {
            attempt: ctx.attempt,
            error: err.clone(),
            delay,
            elapsed: ctx.started_at.elapsed(),
        };
        tracing::warn!(
            attempt = ctx.attempt,
            max_attempts,
            code = err.code(),
            delay_ms = delay.as_millis() as u64,
            "attempt failed; backing off"
        );
        notify(observer, &ev);
        ctx.last_error = Some(err);

        tokio::time::sleep(delay).await;
        ctx.attempt += 1;
    }
}

/// An operation bound to a retry policy; each `call` is one logical call.
pub struct Retrying<F> {
    op: F,
    policy: RetryPolicy,
    observer: Option<RetryObserver>,
}

pub fn with_retry<F>(op: F, policy: RetryPolicy) -> Retrying<F> {
    Retrying {
        op,
        policy,
        observer: None,
    }
}

impl<F> Retrying<F> {
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call<T, Fut>(&self) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(&self.policy, self.observer.as_ref(), |n| (self.op)(n)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: false,
            retryable_codes: Vec::new(),
        }
    }

    fn counting_observer() -> (RetryObserver, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let obs: RetryObserver =
            Arc::new(move |ev: &RetryAttempt| -> std::result::Result<(), BoxError> {
                seen2.lock().unwrap().push(ev.attempt);
                Ok(())
            });
        (obs, seen)
    }

    #[tokio::test]
    async fn succeeds_on_fourth_attempt_after_three_network_failures() {
        let (obs, seen) = counting_observer();
        let calls = AtomicU32::new(0);
        let out = retry(&fast(4), Some(&obs), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 4 {
                    Err(ApiError::network("connection reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn non_retryable_error_makes_exactly_one_attempt() {
        let (obs, seen) = counting_observer();
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry(&fast(5), Some(&obs), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::from_http_status(401, None, None)) }
        })
        .await;
        assert_eq!(out.unwrap_err().kind, ErrorKind::ApiKeyInvalid);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error_unwrapped() {
        let out: Result<()> = retry(&fast(3), None, |attempt| async move {
            Err(ApiError::server(500, format!("failure #{attempt}")))
        })
        .await;
        let e = out.unwrap_err();
        assert_eq!(e.message, "failure #3");
        assert_eq!(e.kind, ErrorKind::ServerFault { status: 500 });
    }

    #[tokio::test]
    async fn allow_list_retries_an_otherwise_terminal_kind() {
        let mut policy = fast(2);
        policy.retryable_codes = vec!["VALIDATION_ERROR".to_string()];
        let calls = AtomicU32::new(0);
        let _: Result<()> = retry(&policy, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::validation(vec!["bad".to_string()])) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broken_observer_does_not_abort_the_call() {
        let failing: RetryObserver =
            Arc::new(|_ev: &RetryAttempt| -> std::result::Result<(), BoxError> {
                Err("observer down".into())
            });
        let out = retry(&fast(3), Some(&failing), |attempt| async move {
            if attempt == 1 {
                Err(ApiError::timeout(Duration::from_millis(1)))
            } else {
                Ok("ok")
            }
        })
        .await;
        assert_eq!(out.unwrap(), "ok");

        let panicking: RetryObserver =
            Arc::new(|_ev: &RetryAttempt| -> std::result::Result<(), BoxError> {
                panic!("observer bug")
            });
        let out = retry(&fast(3), Some(&panicking), |attempt| async move {
            if attempt == 1 {
                Err(ApiError::network("reset"))
            } else {
                Ok("ok")
            }
        })
        .await;
        assert_eq!(out.unwrap(), "ok");
    }

    #[tokio::test]
    async fn wrapper_binds_operation_and_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let c2 = calls.clone();
        let (obs, seen) = counting_observer();
        let wrapped = with_retry(
            move |attempt| {
                c2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err(ApiError::rate_limited("slow down", None))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            fast(3),
        )
        .with_observer(obs);
        assert_eq!(wrapped.call().await.unwrap(), 2);
        assert_eq!(wrapped.call().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(wrapped.policy().max_attempts, 3);
    }

    #[test]
    fn rate_limit_reset_extends_delay_up_to_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };
        let now_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let soon = ApiError::rate_limited("quota", Some(now_s + 2));
        let d = policy.delay_for(1, &soon);
        assert!(d >= Duration::from_millis(1_000), "{d:?}");
        assert!(d <= Duration::from_secs(5));

        let far = ApiError::rate_limited("quota", Some(now_s + 3_600));
        assert_eq!(policy.delay_for(1, &far), Duration::from_secs(5));

        let past = ApiError::rate_limited("quota", Some(1));
        assert_eq!(policy.delay_for(1, &past), Duration::from_millis(10));
    }

    proptest! {
        #[test]
        fn delay_matches_capped_exponential_without_jitter(
            initial_ms in 0u64..5_000,
            factor in 1u32..4,
            attempt in 1u32..12,
            max_ms in 1u64..120_000,
        ) {
            let policy = RetryPolicy {
                max_attempts: 20,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                backoff_factor: factor as f64,
                jitter: false,
                retryable_codes: Vec::new(),
            };
            let expected = (initial_ms as u128 * (factor as u128).pow(attempt - 1)).min(max_ms as u128);
            prop_assert_eq!(policy.backoff_delay(attempt).as_millis(), expected);
        }

        #[test]
        fn jitter_stays_within_a_quarter(base_ms in 0u64..100_000) {
            let d = apply_jitter(Duration::from_millis(base_ms), JITTER_FRACTION).as_millis() as f64;
            let b = base_ms as f64;
            prop_assert!(d >= (b * 0.75).floor() && d <= (b * 1.25).ceil());
        }
    }
}
