//! Failure classification and the retry policy shared by every driver call
//! the executors make.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use sandbox_driver::DriverOutcome;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::DriverCallError;
use crate::settings::OrchestratorSettings;

/// What a failed driver call's diagnostics say about retrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient: timeouts, dropped connections, rate limits, gateway errors.
    Retryable,
    /// The provider no longer knows a resource the driver state still
    /// references. `address` is the state address to strip.
    StaleReference { address: String },
    /// Everything else, including diagnostics nobody recognises.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

static CLASSIFIER: Lazy<FailureClassifier> = Lazy::new(FailureClassifier::new);

pub struct FailureClassifier {
    not_found: Regex,
    resource_address: Regex,
    permanent: Regex,
    retryable: Regex,
}

impl FailureClassifier {
    fn new() -> Self {
        Self {
            not_found: pattern(
                r"(?i)\b404\b|not found|notfound|does not exist|no longer exists|resource_not_found",
            ),
            resource_address: pattern(
                r#"\bwith\s+((?:module\.[\w-]+(?:\["[^"]*"\])?\.)*[\w-]+\.[\w-]+(?:\["[^"]*"\]|\[\d+\])?)"#,
            ),
            permanent: pattern(
                r"(?i)\b40[13]\b|unauthori[sz]ed|forbidden|permission denied|access denied|invalid (?:credentials|configuration|token)|authentication failed|malformed|unsupported argument|invalid value",
            ),
            retryable: pattern(
                r"(?i)timed out|timeout|deadline exceeded|connection (?:reset|refused)|network (?:is )?unreachable|no route to host|rate limit|too many requests|\b429\b|\b50[234]\b|bad gateway|service unavailable|gateway timeout|temporarily unavailable",
            ),
        }
    }

    pub fn global() -> &'static FailureClassifier {
        &CLASSIFIER
    }

    /// Stale references are checked first, then permanent signatures, then
    /// transient ones. A not-found error that names no resource address is
    /// not recoverable and falls through.
    pub fn classify(&self, diagnostics: &str) -> FailureKind {
        if let Some(address) = self.stale_resource_address(diagnostics) {
            return FailureKind::StaleReference { address };
        }
        if self.permanent.is_match(diagnostics) {
            return FailureKind::Permanent;
        }
        if self.retryable.is_match(diagnostics) {
            return FailureKind::Retryable;
        }
        FailureKind::Permanent
    }

    /// The resource a not-found error refers to, if the diagnostics name one.
    pub fn stale_resource_address(&self, diagnostics: &str) -> Option<String> {
        if !self.not_found.is_match(diagnostics) {
            return None;
        }
        self.resource_address
            .captures(diagnostics)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl std::fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureClassifier").finish_non_exhaustive()
    }
}

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("Hardcoded failure pattern should always compile")
}

/// Bounded retries with exponential backoff and a deadline per attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
    classifier: &'static FailureClassifier,
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub ok: bool,
    /// Diagnostics of the last attempt.
    pub diagnostics: String,
    pub attempts: u32,
    /// Classification of the final failure, `None` on success.
    pub failure: Option<FailureKind>,
    /// Total time spent in backoff.
    pub waited: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            attempt_timeout,
            classifier: FailureClassifier::global(),
        }
    }

    /// One try, no backoff.
    pub fn single_attempt(attempt_timeout: Duration) -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, attempt_timeout)
    }

    /// Policy for create/plan/apply: a single attempt bounded by the
    /// creation timeout.
    pub fn creation(settings: &OrchestratorSettings) -> Self {
        Self::single_attempt(settings.creation_timeout())
    }

    pub fn destruction(settings: &OrchestratorSettings) -> Self {
        Self::new(
            settings.destroy_max_retries.saturating_add(1),
            settings.destroy_backoff(),
            settings.max_backoff(),
            settings.destruction_timeout(),
        )
    }

    pub fn classifier(&self) -> &'static FailureClassifier {
        self.classifier
    }

    /// Delay before retry number `retry` (1-based): initial, doubled per
    /// retry, capped at the maximum.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Bounds a fallible driver call by the per-attempt deadline.
    pub async fn bounded<T, Fut>(&self, call: Fut) -> Result<T, DriverCallError>
    where
        Fut: Future<Output = Result<T, DriverCallError>>,
    {
        match timeout(self.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverCallError::TimedOut(self.attempt_timeout)),
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable
    /// signature or runs out of attempts. The closure receives the 1-based
    /// attempt number.
    ///
    /// Each attempt runs on its own task. An attempt that overruns the
    /// deadline is reported as timed out, but the policy waits for it to
    /// finish before retrying or returning, so attempts never overlap.
    pub async fn run<F, Fut>(&self, mut operation: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DriverOutcome> + Send + 'static,
    {
        let mut waited = Duration::ZERO;
        let mut attempt = 1;

        loop {
            let mut task = tokio::spawn(operation(attempt));
            let outcome = match timeout(self.attempt_timeout, &mut task).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    DriverOutcome::failure(DriverCallError::Join(e.to_string()).to_string())
                }
                Err(_) => {
                    warn!(
                        attempt,
                        deadline = ?self.attempt_timeout,
                        "Driver call overran its deadline, waiting for it to return"
                    );
                    let late_ok = task.await.is_ok_and(|late| late.ok);
                    debug!(attempt, late_ok, "Overrunning call returned");
                    DriverOutcome::failure(format!("timed out after {:?}", self.attempt_timeout))
                }
            };

            if outcome.ok {
                if attempt > 1 {
                    debug!(attempt, "Driver call succeeded after retry");
                }
                return RetryOutcome {
                    ok: true,
                    diagnostics: outcome.diagnostics,
                    attempts: attempt,
                    failure: None,
                    waited,
                };
            }

            let kind = self.classifier.classify(&outcome.diagnostics);
            if !kind.is_retryable() || attempt >= self.max_attempts {
                return RetryOutcome {
                    ok: false,
                    diagnostics: outcome.diagnostics,
                    attempts: attempt,
                    failure: Some(kind),
                    waited,
                };
            }

            let backoff = self.backoff_for(attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                backoff = ?backoff,
                "Transient driver failure, retrying"
            );
            sleep(backoff).await;
            waited += backoff;
            attempt += 1;
        }
    }
}
