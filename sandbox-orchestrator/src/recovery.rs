use tracing::{info, instrument, warn};

use crate::retry::{FailureKind, RetryPolicy};
use crate::runner::DriverRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub ok: bool,
    pub diagnostics: String,
    /// A repair cycle ran, whatever its result.
    pub recovered: bool,
    /// `apply` calls made: 1 without recovery, 2 when the cycle got that far.
    pub apply_calls: u32,
}

/// Applies a deployment, repairing a stale provider reference once.
///
/// A stale-reference failure strips the named resource from the driver
/// state, plans again and applies one more time. Any other failure is
/// returned as is.
pub struct RecoveringApplier {
    runner: DriverRunner,
    policy: RetryPolicy,
}

impl RecoveringApplier {
    pub fn new(runner: DriverRunner, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    #[instrument(skip(self), fields(driver = self.runner.driver_name()))]
    pub async fn apply(&self, deployment_id: &str) -> ApplyReport {
        let first = self.policy.run(|_| self.runner.apply(deployment_id)).await;
        if first.ok {
            return ApplyReport {
                ok: true,
                diagnostics: first.diagnostics,
                recovered: false,
                apply_calls: 1,
            };
        }

        let address = match first.failure {
            Some(FailureKind::StaleReference { address }) => address,
            _ => {
                return ApplyReport {
                    ok: false,
                    diagnostics: first.diagnostics,
                    recovered: false,
                    apply_calls: 1,
                }
            }
        };

        warn!(%address, "Stale provider reference, starting recovery");

        if let Err(e) = self
            .policy
            .bounded(self.runner.strip_stale_reference(deployment_id, &address))
            .await
        {
            return ApplyReport {
                ok: false,
                diagnostics: format!("recovery failed at strip: {e}"),
                recovered: true,
                apply_calls: 1,
            };
        }

        let plan = self.policy.run(|_| self.runner.plan(deployment_id)).await;
        if !plan.ok {
            return ApplyReport {
                ok: false,
                diagnostics: format!("recovery failed at plan: {}", plan.diagnostics),
                recovered: true,
                apply_calls: 1,
            };
        }

        let second = self.policy.run(|_| self.runner.apply(deployment_id)).await;
        if second.ok {
            info!(%address, "Recovered from stale provider reference");
        }
        ApplyReport {
            ok: second.ok,
            diagnostics: second.diagnostics,
            recovered: true,
            apply_calls: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use sandbox_driver::mock::{DriverCall, MockDriver};
    use sandbox_driver::DriverOutcome;

    const STALE: &str = "Error: 404 Not Found: project not found\n  with scaleway_account_project.member,";

    fn applier(mock: &Arc<MockDriver>) -> RecoveringApplier {
        RecoveringApplier::new(
            DriverRunner::new(mock.clone()),
            RetryPolicy::single_attempt(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn success_needs_no_recovery() {
        let mock = Arc::new(MockDriver::new());
        let report = applier(&mock).apply("dep-1").await;

        assert!(report.ok);
        assert!(!report.recovered);
        assert_eq!(mock.count("apply"), 1);
    }

    #[tokio::test]
    async fn stale_reference_is_stripped_and_reapplied() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure(STALE));

        let report = applier(&mock).apply("dep-1").await;

        assert!(report.ok);
        assert!(report.recovered);
        assert_eq!(report.apply_calls, 2);
        assert_eq!(mock.count("apply"), 2);
        assert_eq!(
            mock.calls(),
            vec![
                DriverCall::Apply("dep-1".into()),
                DriverCall::StripStaleReference {
                    id: "dep-1".into(),
                    address: "scaleway_account_project.member".into(),
                },
                DriverCall::Plan("dep-1".into()),
                DriverCall::Apply("dep-1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn other_failures_are_not_recovered() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure("Error: 403 Forbidden"));

        let report = applier(&mock).apply("dep-1").await;

        assert!(!report.ok);
        assert!(!report.recovered);
        assert_eq!(mock.count("apply"), 1);
        assert_eq!(mock.count("strip"), 0);
    }

    #[tokio::test]
    async fn failed_replan_ends_the_cycle() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure(STALE))
            .push_plan(DriverOutcome::failure("Error: invalid configuration"));

        let report = applier(&mock).apply("dep-1").await;

        assert!(!report.ok);
        assert!(report.recovered);
        assert!(report
            .diagnostics
            .starts_with("recovery failed at plan: Error: invalid configuration"));
        assert_eq!(mock.count("apply"), 1);
    }

    #[tokio::test]
    async fn only_one_cycle_per_call() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure(STALE))
            .push_apply(DriverOutcome::failure(STALE));

        let report = applier(&mock).apply("dep-1").await;

        assert!(!report.ok);
        assert!(report.recovered);
        assert_eq!(mock.count("apply"), 2);
        assert_eq!(mock.count("strip"), 1);
    }

    #[tokio::test]
    async fn failed_strip_is_reported() {
        let mock = Arc::new(MockDriver::new());
        mock.push_apply(DriverOutcome::failure(STALE))
            .fail_strip("state is locked");

        let report = applier(&mock).apply("dep-1").await;

        assert!(!report.ok);
        assert!(report.diagnostics.contains("recovery failed at strip"));
        assert_eq!(mock.count("plan"), 0);
    }
}
