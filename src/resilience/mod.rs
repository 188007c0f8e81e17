//! Resilient invocation of external calls.
//!
//! [`ResilientInvoker`] is the single place where retry policy exists: every
//! judgment and adapter call goes through it. Only rate-limit and quota
//! failures are retried, with exponential backoff; anything else is returned
//! immediately. [`CancelScope`] carries the caller's cancellation token and
//! deadline so that every suspension point can observe them.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RequestConfig;
use crate::error::{InvokeError, ServiceError};

/// Lowercased message fragments that identify rate-limit and quota errors.
const RATE_LIMIT_MARKERS: [&str; 6] = [
    "429",
    "quota",
    "rate limit",
    "resourceexhausted",
    "resource_exhausted",
    "too many requests",
];

/// Classification of errors that may succeed if retried later.
pub trait RateLimited {
    /// Whether this error signals a rate-limit or exhausted quota.
    fn is_rate_limited(&self) -> bool;
}

/// Check an error message for rate-limit markers (case-insensitive).
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl RateLimited for ServiceError {
    fn is_rate_limited(&self) -> bool {
        match self {
            ServiceError::Api { status: 429, .. } => true,
            ServiceError::Api { message, .. } => is_rate_limit_message(message),
            ServiceError::Http(e) => e.status().map(|status| status.as_u16()) == Some(429),
            // Model output and local diagnostics.
            ServiceError::InvalidResponse { .. }
            | ServiceError::Timeout { .. }
            | ServiceError::Rejected { .. } => false,
        }
    }
}

/// Backoff policy for rate-limited calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed (values below 1 are treated as 1).
    pub max_retries: u32,
    /// Delay before the second attempt; doubled for each attempt after.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Policy from request configuration
    pub fn from_config(config: &RequestConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// Backoff after the given zero-based failed attempt: `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}

/// Why a guarded future was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token was cancelled.
    Token,
    /// The session deadline passed.
    Deadline { timeout_ms: u64 },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Token => write!(f, "cancellation requested by caller"),
            CancelReason::Deadline { timeout_ms } => {
                write!(f, "deadline of {}ms exceeded", timeout_ms)
            }
        }
    }
}

/// Cancellation token plus optional deadline for one session.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
    timeout_ms: u64,
}

impl CancelScope {
    /// Scope with no deadline.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            timeout_ms: 0,
        }
    }

    /// Scope that also expires `timeout` from now.
    pub fn with_timeout(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Some(Instant::now() + timeout),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Scope that can never be cancelled (tests and one-off tools).
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast if the scope is already cancelled or expired.
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.token.is_cancelled() {
            return Err(CancelReason::Token);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CancelReason::Deadline {
                    timeout_ms: self.timeout_ms,
                });
            }
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the token fires, or the deadline passes.
    ///
    /// On cancellation the future is dropped, abandoning any in-flight request.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CancelReason::Token),
            _ = deadline => Err(CancelReason::Deadline { timeout_ms: self.timeout_ms }),
            output = fut => Ok(output),
        }
    }
}

/// Retry wrapper shared by every external call.
#[derive(Debug, Clone, Default)]
pub struct ResilientInvoker {
    policy: RetryPolicy,
}

impl ResilientInvoker {
    /// Create an invoker with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Call `operation` until it succeeds, fails with a non-retryable error,
    /// exhausts the attempt budget, or the scope is cancelled.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        op_name: &str,
        scope: &CancelScope,
        mut operation: F,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimited + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            scope.check().map_err(|reason| InvokeError::Cancelled {
                reason: reason.to_string(),
            })?;

            let start = Instant::now();
            let result = scope
                .guard(operation())
                .await
                .map_err(|reason| InvokeError::Cancelled {
                    reason: reason.to_string(),
                })?;
            attempt += 1;

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            op = %op_name,
                            attempts = attempt,
                            latency_ms = start.elapsed().as_millis(),
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_rate_limited() {
                debug!(op = %op_name, error = %error, "Non-retryable failure");
                return Err(InvokeError::Failed(error));
            }

            if attempt >= max_attempts {
                error!(
                    op = %op_name,
                    attempts = attempt,
                    error = %error,
                    "Rate limit persisted, giving up"
                );
                return Err(InvokeError::RetryExhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                op = %op_name,
                retry = attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "Rate limited, backing off"
            );
            scope
                .guard(tokio::time::sleep(delay))
                .await
                .map_err(|reason| InvokeError::Cancelled {
                    reason: reason.to_string(),
                })?;
        }
    }
}
