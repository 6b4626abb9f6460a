// =============================================================================
// Error taxonomy and recovery strategies for exchange boundaries
// =============================================================================
//
// Every exchange call site declares how its failures are handled:
//   Retry     — exponential backoff, honours retry-after on rate limits
//   Fallback  — one invocation of a caller-supplied alternate path
//   Degrade   — continue with reduced functionality (no value produced)
//   Skip      — log and swallow
//   FailFast  — propagate immediately
//
// FailFast is never downgraded to a recovery path.
// =============================================================================

use thiserror::Error;
use tracing::{debug, info, warn};

/// How severe an error is, for notification routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Typed exchange error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited (retry after {retry_after_ms} ms): {message}")]
    RateLimit { retry_after_ms: u64, message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("insufficient funds: {message}")]
    InsufficientFunds { message: String },

    #[error("stale data: {message}")]
    StaleData { message: String },

    #[error("unknown exchange error (code {code}): {message}")]
    Unknown { code: String, message: String },
}

impl ExchangeError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unknown(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unknown {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable code for notifications and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "RATE_LIMIT",
            Self::Network { .. } => "NETWORK",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Authentication { .. } => "AUTHENTICATION",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::StaleData { .. } => "STALE_DATA",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::RateLimit { .. } | Self::StaleData { .. } => Severity::Warning,
            Self::Network { .. } | Self::NotFound { .. } | Self::Unknown { .. } => Severity::Error,
            Self::InvalidArgument { .. } => Severity::Error,
            Self::Authentication { .. } | Self::InsufficientFunds { .. } => Severity::Critical,
        }
    }

    /// Whether a retry can reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Network { .. } | Self::StaleData { .. }
        )
    }

    /// For rate limits, the server-requested wait before the next attempt.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Result alias for exchange-facing calls.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// Recovery strategies
// ---------------------------------------------------------------------------

/// Backoff configuration for the retry strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }

    /// Delay before the given retry (1-based attempt index):
    /// `min(initial * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        (raw as u64).min(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// How a call site responds to failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    Retry(RetryConfig),
    /// One invocation of a caller-supplied alternate path.
    Fallback,
    /// Continue with reduced functionality; success without a value.
    Degrade,
    /// Log and swallow.
    Skip,
    /// Propagate immediately.
    FailFast,
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry(_) => "retry",
            Self::Fallback => "fallback",
            Self::Degrade => "degrade",
            Self::Skip => "skip",
            Self::FailFast => "fail-fast",
        }
    }
}

/// Outcome of running an operation under a recovery strategy.
#[derive(Debug)]
pub struct RecoveryOutcome<T> {
    pub value: Option<T>,
    pub error: Option<ExchangeError>,
    pub attempts: u32,
}

impl<T> RecoveryOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Observation hooks invoked by [`run_with_recovery`]. Default methods log.
pub trait RecoveryHooks: Send + Sync {
    /// Called before each backoff sleep.
    fn on_retry(&self, attempt: u32, error: &ExchangeError, delay_ms: u64) {
        warn!(
            attempt,
            delay_ms,
            code = error.code(),
            error = %error,
            "operation failed — retrying"
        );
    }

    /// Called once when the operation eventually succeeds (or degrades).
    fn on_recover(&self, strategy: &str, attempts: u32) {
        info!(strategy, attempts, "operation recovered");
    }
}

/// Hooks that only log (the default in production wiring).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl RecoveryHooks for LogHooks {}

/// Run `op` under `strategy`.
///
/// For `Retry`, non-retryable errors fail immediately regardless of the
/// remaining attempt budget; a rate limit's `retry_after_ms` replaces the
/// computed delay on the first retry.
///
/// `Fallback` is resolved by the caller: this function reports the failure and
/// the caller invokes its alternate path (see [`run_with_fallback`]).
pub async fn run_with_recovery<T, F, Fut>(
    op: F,
    strategy: &RecoveryStrategy,
    hooks: &dyn RecoveryHooks,
) -> RecoveryOutcome<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    match strategy {
        RecoveryStrategy::Retry(config) => {
            let mut attempt = 1u32;
            loop {
                match op().await {
                    Ok(value) => {
                        if attempt > 1 {
                            hooks.on_recover("retry", attempt);
                        }
                        return RecoveryOutcome {
                            value: Some(value),
                            error: None,
                            attempts: attempt,
                        };
                    }
                    Err(err) => {
                        if !err.retryable() || attempt >= config.max_attempts {
                            return RecoveryOutcome {
                                value: None,
                                error: Some(err),
                                attempts: attempt,
                            };
                        }

                        let mut delay = config.delay_for_attempt(attempt);
                        if attempt == 1 {
                            if let Some(after) = err.retry_after_ms() {
                                delay = after;
                            }
                        }

                        hooks.on_retry(attempt, &err, delay);
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                        attempt += 1;
                    }
                }
            }
        }
        RecoveryStrategy::Degrade => match op().await {
            Ok(value) => RecoveryOutcome {
                value: Some(value),
                error: None,
                attempts: 1,
            },
            Err(err) => {
                warn!(code = err.code(), error = %err, "degrading after failure");
                hooks.on_recover("degrade", 1);
                RecoveryOutcome {
                    value: None,
                    error: None,
                    attempts: 1,
                }
            }
        },
        RecoveryStrategy::Skip => match op().await {
            Ok(value) => RecoveryOutcome {
                value: Some(value),
                error: None,
                attempts: 1,
            },
            Err(err) => {
                debug!(code = err.code(), error = %err, "skipping failed operation");
                RecoveryOutcome {
                    value: None,
                    error: None,
                    attempts: 1,
                }
            }
        },
        RecoveryStrategy::Fallback | RecoveryStrategy::FailFast => match op().await {
            Ok(value) => RecoveryOutcome {
                value: Some(value),
                error: None,
                attempts: 1,
            },
            Err(err) => RecoveryOutcome {
                value: None,
                error: Some(err),
                attempts: 1,
            },
        },
    }
}

/// Run `primary`; on failure, invoke `fallback` exactly once.
pub async fn run_with_fallback<T, F, Fut, G, FutG>(
    primary: F,
    fallback: G,
    hooks: &dyn RecoveryHooks,
) -> RecoveryOutcome<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
    G: FnOnce() -> FutG,
    FutG: std::future::Future<Output = ExchangeResult<T>>,
{
    match primary().await {
        Ok(value) => RecoveryOutcome {
            value: Some(value),
            error: None,
            attempts: 1,
        },
        Err(primary_err) => {
            warn!(
                code = primary_err.code(),
                error = %primary_err,
                "primary path failed — invoking fallback"
            );
            match fallback().await {
                Ok(value) => {
                    hooks.on_recover("fallback", 2);
                    RecoveryOutcome {
                        value: Some(value),
                        error: None,
                        attempts: 2,
                    }
                }
                Err(fallback_err) => RecoveryOutcome {
                    value: None,
                    error: Some(fallback_err),
                    attempts: 2,
                },
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingHooks {
        retries: AtomicU32,
        recoveries: AtomicU32,
        last_delay: AtomicU64,
    }

    impl CountingHooks {
        fn new() -> Self {
            Self {
                retries: AtomicU32::new(0),
                recoveries: AtomicU32::new(0),
                last_delay: AtomicU64::new(0),
            }
        }
    }

    impl RecoveryHooks for CountingHooks {
        fn on_retry(&self, _attempt: u32, _error: &ExchangeError, delay_ms: u64) {
            self.retries.fetch_add(1, Ordering::SeqCst);
            self.last_delay.store(delay_ms, Ordering::SeqCst);
        }

        fn on_recover(&self, _strategy: &str, _attempts: u32) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn backoff_delays_are_capped() {
        let config = RetryConfig {
            max_attempts: 6,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 500,
        };
        assert_eq!(config.delay_for_attempt(1), 100);
        assert_eq!(config.delay_for_attempt(2), 200);
        assert_eq!(config.delay_for_attempt(3), 400);
        assert_eq!(config.delay_for_attempt(4), 500);
        assert_eq!(config.delay_for_attempt(5), 500);
    }

    #[test]
    fn retryable_classification() {
        assert!(ExchangeError::RateLimit {
            retry_after_ms: 100,
            message: "slow down".into()
        }
        .retryable());
        assert!(ExchangeError::network("timeout").retryable());
        assert!(!ExchangeError::invalid_argument("bad qty").retryable());
        assert!(!ExchangeError::Authentication {
            message: "bad key".into()
        }
        .retryable());
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let hooks = CountingHooks::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let strategy = RecoveryStrategy::Retry(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 5,
        });

        let outcome = run_with_recovery(
            move || {
                let calls = calls_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExchangeError::network("flaky"))
                    } else {
                        Ok(42u32)
                    }
                }
            },
            &strategy,
            &hooks,
        )
        .await;

        assert_eq!(outcome.value, Some(42));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(hooks.retries.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_fails_immediately_on_non_retryable() {
        let hooks = CountingHooks::new();
        let strategy = RecoveryStrategy::Retry(RetryConfig::new(5, 1));

        let outcome: RecoveryOutcome<u32> = run_with_recovery(
            || async { Err(ExchangeError::invalid_argument("rejected")) },
            &strategy,
            &hooks,
        )
        .await;

        assert!(outcome.value.is_none());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(hooks.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limit_retry_after_overrides_first_delay() {
        let hooks = CountingHooks::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let strategy = RecoveryStrategy::Retry(RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 100,
        });

        let outcome = run_with_recovery(
            move || {
                let calls = calls_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ExchangeError::RateLimit {
                            retry_after_ms: 7,
                            message: "429".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            &strategy,
            &hooks,
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(hooks.last_delay.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn degrade_swallows_error_without_value() {
        let hooks = CountingHooks::new();
        let outcome: RecoveryOutcome<u32> = run_with_recovery(
            || async { Err(ExchangeError::network("down")) },
            &RecoveryStrategy::Degrade,
            &hooks,
        )
        .await;

        assert!(outcome.is_ok());
        assert!(outcome.value.is_none());
    }

    #[tokio::test]
    async fn fail_fast_propagates() {
        let hooks = CountingHooks::new();
        let outcome: RecoveryOutcome<u32> = run_with_recovery(
            || async { Err(ExchangeError::network("down")) },
            &RecoveryStrategy::FailFast,
            &hooks,
        )
        .await;

        assert!(!outcome.is_ok());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn fallback_invoked_once() {
        let hooks = CountingHooks::new();
        let outcome = run_with_fallback(
            || async { Err(ExchangeError::network("primary down")) },
            || async { Ok(7u32) },
            &hooks,
        )
        .await;

        assert_eq!(outcome.value, Some(7));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(hooks.recoveries.load(Ordering::SeqCst), 1);
    }
}
