//! Retry controller for provider and tool-server calls
//!
//! Every outbound call goes through [`RetryController::invoke`]: bounded
//! exponential backoff, per-attempt timeout, cancellation, and a pluggable
//! failure classifier.

use crate::models::{FailureKind, UpstreamFailure};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after the given failed attempt (1-based): base × 2^(attempt−1), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Maps a raw error to a failure kind
pub trait FailureClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> FailureKind;
}

impl<E, F> FailureClassifier<E> for F
where
    F: Fn(&E) -> FailureKind + Send + Sync,
{
    fn classify(&self, error: &E) -> FailureKind {
        self(error)
    }
}

/// Default classification for provider and tool-server failures
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier<UpstreamFailure> for DefaultClassifier {
    fn classify(&self, error: &UpstreamFailure) -> FailureKind {
        if let Some(kind) = error.kind {
            return kind;
        }

        let body = error.message.to_lowercase();
        let mentions_context = body.contains("context length")
            || body.contains("context_length")
            || body.contains("context window")
            || body.contains("too many tokens")
            || body.contains("prompt is too long");

        if let Some(status) = error.status {
            return match status {
                429 | 503 | 529 => FailureKind::Overloaded,
                408 | 504 => FailureKind::Timeout,
                502 => FailureKind::Unavailable,
                400 | 413 if mentions_context => FailureKind::ContextOverflow,
                500..=599 => FailureKind::Unavailable,
                _ => FailureKind::Fatal,
            };
        }

        if mentions_context {
            FailureKind::ContextOverflow
        } else if body.contains("overloaded") || body.contains("rate limit") {
            FailureKind::Overloaded
        } else if body.contains("timed out") || body.contains("timeout") {
            FailureKind::Timeout
        } else if body.contains("connection refused")
            || body.contains("unreachable")
            || body.contains("not running")
        {
            FailureKind::Unavailable
        } else {
            FailureKind::Fatal
        }
    }
}

/// Retry state machine: Idle → Attempting → {Succeeded, Retrying, Exhausted}
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, last: FailureKind, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32, last: FailureKind },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Exhausted { .. })
    }

    /// Transition after an attempt resolved
    fn on_result(&self, policy: &RetryPolicy, failure: Option<FailureKind>) -> RetryState {
        let attempt = match self {
            RetryState::Attempting { attempt } => *attempt,
            other => return other.clone(),
        };

        match failure {
            None => RetryState::Succeeded { attempts: attempt },
            Some(kind) if kind.is_retryable() && attempt < policy.max_attempts => {
                RetryState::Retrying {
                    attempt,
                    last: kind,
                    delay: policy.delay_for_attempt(attempt),
                }
            }
            Some(kind) => RetryState::Exhausted {
                attempts: attempt,
                last: kind,
            },
        }
    }

    fn next_attempt(&self) -> RetryState {
        match self {
            RetryState::Idle => RetryState::Attempting { attempt: 1 },
            RetryState::Retrying { attempt, .. } => RetryState::Attempting {
                attempt: attempt + 1,
            },
            other => other.clone(),
        }
    }
}

/// Per-invocation bookkeeping, never persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryReport {
    pub attempts: u32,
    /// Delay slept before each retry, in order
    pub delays: Vec<Duration>,
    pub last_failure: Option<FailureKind>,
}

#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub report: RetryReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub kind: FailureKind,
    pub message: String,
    pub report: RetryReport,
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        self.report.attempts
    }
}

/// Wraps outbound calls with classified, bounded retry
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `action` until it succeeds, fails non-retryably, exhausts the
    /// attempt budget, or `cancel` fires. Attempts are strictly sequential.
    pub async fn invoke<T, E, F, Fut, C>(
        &self,
        operation: &str,
        classifier: &C,
        cancel: &CancellationToken,
        mut action: F,
    ) -> std::result::Result<Retried<T>, RetryFailure>
    where
        E: std::fmt::Display,
        C: FailureClassifier<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut state = RetryState::Idle;
        let mut report = RetryReport::default();

        loop {
            state = state.next_attempt();
            let attempt = match state {
                RetryState::Attempting { attempt } => attempt,
                _ => unreachable!("next_attempt always yields Attempting from Idle or Retrying"),
            };

            if cancel.is_cancelled() {
                return Err(cancelled(operation, report));
            }

            report.attempts = attempt;
            debug!(operation, attempt, "Attempting call");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(operation, report)),
                result = timeout(self.policy.call_timeout, action()) => result,
            };

            let (failure, message) = match outcome {
                Ok(Ok(value)) => {
                    state = state.on_result(&self.policy, None);
                    debug!(operation, ?state, "Call succeeded");
                    return Ok(Retried { value, report });
                }
                Ok(Err(error)) => (classifier.classify(&error), error.to_string()),
                Err(_) => (
                    FailureKind::Timeout,
                    format!(
                        "{} timed out after {} ms",
                        operation,
                        self.policy.call_timeout.as_millis()
                    ),
                ),
            };

            report.last_failure = Some(failure);
            state = state.on_result(&self.policy, Some(failure));

            match state {
                RetryState::Retrying { delay, .. } => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = %failure,
                        error = %message,
                        "Retrying after error"
                    );
                    report.delays.push(delay);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(cancelled(operation, report)),
                        _ = sleep(delay) => {}
                    }
                }
                RetryState::Exhausted { attempts, last } => {
                    warn!(operation, attempts, kind = %last, error = %message, "Call failed");
                    return Err(RetryFailure {
                        kind: last,
                        message,
                        report,
                    });
                }
                _ => unreachable!("attempt results only lead to Retrying or Exhausted"),
            }
        }
    }
}

fn cancelled(operation: &str, report: RetryReport) -> RetryFailure {
    debug!(operation, attempts = report.attempts, "Call cancelled");
    RetryFailure {
        kind: FailureKind::Cancelled,
        message: format!("{} cancelled", operation),
        report,
    }
}
