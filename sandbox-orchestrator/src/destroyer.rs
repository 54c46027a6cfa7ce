use tracing::{debug, instrument, warn};

use crate::retry::RetryPolicy;
use crate::runner::DriverRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    pub ok: bool,
    pub diagnostics: String,
    pub attempts: u32,
}

/// `destroy` under the destruction retry policy.
pub struct RetryingDestroyer {
    runner: DriverRunner,
    policy: RetryPolicy,
}

impl RetryingDestroyer {
    pub fn new(runner: DriverRunner, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, id: &str) -> DestroyReport {
        let outcome = self
            .policy
            .run(|attempt| {
                debug!(attempt, "Destroying");
                self.runner.destroy(id)
            })
            .await;

        if outcome.ok {
            return DestroyReport {
                ok: true,
                diagnostics: outcome.diagnostics,
                attempts: outcome.attempts,
            };
        }

        let exhausted = outcome.failure.as_ref().is_some_and(|kind| kind.is_retryable());
        let diagnostics = if exhausted {
            format!(
                "destroy of {id} failed after {} attempts: {}",
                outcome.attempts, outcome.diagnostics
            )
        } else {
            format!(
                "destroy of {id} failed with non-retryable error: {}",
                outcome.diagnostics
            )
        };
        warn!(attempts = outcome.attempts, "{diagnostics}");

        DestroyReport {
            ok: false,
            diagnostics,
            attempts: outcome.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use sandbox_driver::mock::MockDriver;
    use sandbox_driver::{DeploymentConfig, DriverOutcome, ProvisioningDriver};
    use tokio::time::Instant;

    use crate::settings::OrchestratorSettings;

    fn destroyer(mock: &Arc<MockDriver>) -> RetryingDestroyer {
        RetryingDestroyer::new(
            DriverRunner::new(mock.clone()),
            RetryPolicy::destruction(&OrchestratorSettings::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success() {
        let mock = Arc::new(MockDriver::new());
        mock.push_destroy(DriverOutcome::failure("Error: 503 Service Unavailable"));

        let started = Instant::now();
        let report = destroyer(&mock).destroy("m-1").await;

        assert!(report.ok);
        assert_eq!(report.attempts, 2);
        assert_eq!(mock.count("destroy"), 2);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_stops_immediately() {
        let mock = Arc::new(MockDriver::new());
        mock.push_destroy(DriverOutcome::failure("Error: 403 Forbidden"));

        let report = destroyer(&mock).destroy("m-1").await;

        assert!(!report.ok);
        assert_eq!(report.attempts, 1);
        assert_eq!(mock.count("destroy"), 1);
        assert_eq!(
            report.diagnostics,
            "destroy of m-1 failed with non-retryable error: Error: 403 Forbidden"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_names_attempts_and_last_error() {
        let mock = Arc::new(MockDriver::new());
        mock.push_destroy(DriverOutcome::failure("connection reset by peer"))
            .push_destroy(DriverOutcome::failure("connection reset by peer"))
            .push_destroy(DriverOutcome::failure("Error: 504 Gateway Timeout"));

        let started = Instant::now();
        let report = destroyer(&mock).destroy("m-1").await;

        assert!(!report.ok);
        assert_eq!(report.attempts, 3);
        assert_eq!(mock.count("destroy"), 3);
        assert_eq!(
            report.diagnostics,
            "destroy of m-1 failed after 3 attempts: Error: 504 Gateway Timeout"
        );
        assert!(started.elapsed() >= Duration::from_secs(90));
    }

    /// Destroys slowly and records how many destroys run at once.
    #[derive(Default)]
    struct SlowDestroyDriver {
        running: AtomicU32,
        max_running: AtomicU32,
        calls: AtomicU32,
    }

    impl ProvisioningDriver for SlowDestroyDriver {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn create(&self, _id: &str, _config: &DeploymentConfig) -> sandbox_driver::Result<()> {
            Ok(())
        }

        fn plan(&self, _id: &str) -> DriverOutcome {
            DriverOutcome::success("")
        }

        fn apply(&self, _id: &str) -> DriverOutcome {
            DriverOutcome::success("")
        }

        fn destroy(&self, _id: &str) -> DriverOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(250));
            self.running.fetch_sub(1, Ordering::SeqCst);
            DriverOutcome::failure("Error: 503 Service Unavailable")
        }

        fn outputs(&self, _id: &str) -> sandbox_driver::Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        fn strip_stale_reference(&self, _id: &str, _address: &str) -> sandbox_driver::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn timed_out_destroys_never_overlap() {
        let driver = Arc::new(SlowDestroyDriver::default());
        let destroyer = RetryingDestroyer::new(
            DriverRunner::new(driver.clone()),
            RetryPolicy::new(
                3,
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(100),
            ),
        );

        let report = destroyer.destroy("m-1").await;

        assert!(!report.ok);
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.diagnostics,
            "destroy of m-1 failed after 3 attempts: timed out after 100ms"
        );
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(driver.max_running.load(Ordering::SeqCst), 1);
        // Nothing is left running once the report is in.
        assert_eq!(driver.running.load(Ordering::SeqCst), 0);
    }
}
