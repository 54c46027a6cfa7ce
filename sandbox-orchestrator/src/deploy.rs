use sandbox_driver::{member_outputs, DeploymentConfig};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::attempt::{AttemptAction, AttemptRecord};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::notify::{publish_quietly, WorkshopEvent};
use crate::recovery::RecoveringApplier;
use crate::retry::RetryPolicy;
use crate::workshop::{Member, MemberStatus, WorkshopStatus};

/// Splits `items` into consecutive groups of at most `size`, keeping order.
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub groups: usize,
    pub provisioned: usize,
    pub failed: usize,
    /// Groups where a stale-reference recovery cycle ran.
    pub recovered_groups: usize,
    pub failed_members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<WorkshopStatus>,
}

/// Provisions pending members group by group.
pub struct BatchDeployer {
    ctx: ExecutionContext,
    policy: RetryPolicy,
    applier: RecoveringApplier,
}

struct InFlight {
    member: Member,
    attempt: AttemptRecord,
}

impl BatchDeployer {
    pub fn new(ctx: ExecutionContext) -> Self {
        let policy = RetryPolicy::creation(&ctx.settings);
        let applier = RecoveringApplier::new(ctx.runner.clone(), policy.clone());
        Self {
            ctx,
            policy,
            applier,
        }
    }

    /// Deploys every pending member of the workshop.
    #[instrument(skip(self))]
    pub async fn deploy(&self, workshop_id: &str) -> Result<DeploymentReport> {
        let workshop = self.ctx.store.get_workshop(workshop_id).await?;
        if !workshop.accepts_deployments() {
            return Err(OrchestratorError::InvalidState(format!(
                "workshop {workshop_id} is {}",
                workshop.status
            )));
        }

        let lease = self
            .ctx
            .aggregator
            .begin(workshop_id, WorkshopStatus::Deploying)
            .await?;

        // Members left provisioning by an interrupted run go out again.
        let pending: Vec<Member> = self
            .ctx
            .store
            .list_members(workshop_id)
            .await?
            .into_iter()
            .filter(|m| {
                if m.status == MemberStatus::Provisioning {
                    warn!(member_id = %m.id, "Redeploying member left provisioning");
                }
                matches!(m.status, MemberStatus::Pending | MemberStatus::Provisioning)
            })
            .collect();

        let groups = partition(&pending, self.ctx.settings.batch_size);
        info!(
            members = pending.len(),
            groups = groups.len(),
            "Starting workshop deployment"
        );

        let mut report = DeploymentReport {
            groups: groups.len(),
            ..Default::default()
        };
        let last = groups.len().saturating_sub(1);
        for (index, group) in groups.into_iter().enumerate() {
            self.deploy_group(workshop_id, index, group, AttemptAction::Deploy, &mut report)
                .await?;

            if index < last {
                let cooldown = self.ctx.settings.group_cooldown();
                info!(cooldown_secs = cooldown.as_secs(), "Cooling down before next group");
                sleep(cooldown).await;
            }
        }

        report.final_status = Some(lease.finalize().await?);
        self.finish(workshop_id, &report).await;
        Ok(report)
    }

    /// Provisions one failed member again as a group of its own.
    #[instrument(skip(self))]
    pub async fn retry(&self, member_id: &str) -> Result<DeploymentReport> {
        let member = self.ctx.store.get_member(member_id).await?;
        if member.status != MemberStatus::Failed {
            return Err(OrchestratorError::InvalidState(format!(
                "member {member_id} is {}, only failed members can be retried",
                member.status
            )));
        }

        let workshop = self.ctx.store.get_workshop(&member.workshop_id).await?;
        if !workshop.accepts_deployments() {
            return Err(OrchestratorError::InvalidState(format!(
                "workshop {} is {}",
                workshop.id, workshop.status
            )));
        }

        let lease = self
            .ctx
            .aggregator
            .begin(&workshop.id, WorkshopStatus::Deploying)
            .await?;

        let mut report = DeploymentReport {
            groups: 1,
            ..Default::default()
        };
        self.deploy_group(&workshop.id, 0, vec![member], AttemptAction::Retry, &mut report)
            .await?;

        report.final_status = Some(lease.finalize().await?);
        self.finish(&workshop.id, &report).await;
        Ok(report)
    }

    async fn finish(&self, workshop_id: &str, report: &DeploymentReport) {
        info!(
            workshop_id,
            provisioned = report.provisioned,
            failed = report.failed,
            "Deployment finished"
        );
        publish_quietly(
            self.ctx.notifier.as_ref(),
            workshop_id,
            WorkshopEvent::DeploymentFinished {
                report: report.clone(),
            },
        )
        .await;
    }

    /// Runs one driver invocation for `group`. Driver failures are recorded
    /// on the members; only store errors are returned.
    #[instrument(skip(self, group, report), fields(group = index, size = group.len()))]
    async fn deploy_group(
        &self,
        workshop_id: &str,
        index: usize,
        group: Vec<Member>,
        action: AttemptAction,
        report: &mut DeploymentReport,
    ) -> Result<()> {
        let short = Uuid::new_v4().simple().to_string();
        let deployment_id = format!("{workshop_id}-g{index}-{}", &short[..8]);

        let mut in_flight = Vec::with_capacity(group.len());
        for mut member in group {
            member.deployment_id = Some(deployment_id.clone());
            member.error_message = None;
            member.resource_handles.clear();
            self.ctx
                .save_member(&mut member, MemberStatus::Provisioning)
                .await?;
            let attempt = self.ctx.start_attempt(&member, action).await?;
            in_flight.push(InFlight { member, attempt });
        }

        let config = DeploymentConfig::chained(
            &deployment_id,
            workshop_id,
            in_flight
                .iter()
                .map(|f| (f.member.id.clone(), f.member.name.clone())),
        );

        if let Err(e) = self
            .policy
            .bounded(self.ctx.runner.create(&deployment_id, config))
            .await
        {
            let diagnostics = format!("create failed: {e}");
            return self.fail_group(in_flight, &diagnostics, false, 0, report).await;
        }

        let plan = self.policy.run(|_| self.ctx.runner.plan(&deployment_id)).await;
        if !plan.ok {
            let diagnostics = format!("plan failed: {}", plan.diagnostics);
            return self.fail_group(in_flight, &diagnostics, false, 0, report).await;
        }

        let applied = self.applier.apply(&deployment_id).await;
        if applied.recovered {
            report.recovered_groups += 1;
        }
        if !applied.ok {
            return self
                .fail_group(
                    in_flight,
                    &applied.diagnostics,
                    applied.recovered,
                    applied.apply_calls,
                    report,
                )
                .await;
        }

        let outputs = match self
            .policy
            .bounded(self.ctx.runner.outputs(&deployment_id))
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => {
                let diagnostics = format!("outputs unavailable: {e}");
                return self
                    .fail_group(
                        in_flight,
                        &diagnostics,
                        applied.recovered,
                        applied.apply_calls,
                        report,
                    )
                    .await;
            }
        };

        for InFlight { mut member, attempt } in in_flight {
            let handles = member_outputs(&outputs, &member.id);
            if handles.is_empty() {
                let diagnostics = format!("no outputs exported for member {}", member.id);
                warn!(member_id = %member.id, "{diagnostics}");
                member.error_message = Some(diagnostics.clone());
                self.ctx.save_member(&mut member, MemberStatus::Failed).await?;
                self.ctx
                    .finish_attempt(
                        attempt,
                        false,
                        &diagnostics,
                        applied.recovered,
                        applied.apply_calls,
                    )
                    .await?;
                report.failed += 1;
                report.failed_members.push(member.id);
                continue;
            }

            member.resource_handles = handles;
            self.ctx
                .save_member(&mut member, MemberStatus::Provisioned)
                .await?;
            self.ctx
                .finish_attempt(
                    attempt,
                    true,
                    &applied.diagnostics,
                    applied.recovered,
                    applied.apply_calls,
                )
                .await?;
            report.provisioned += 1;
        }

        Ok(())
    }

    async fn fail_group(
        &self,
        in_flight: Vec<InFlight>,
        diagnostics: &str,
        recovered: bool,
        driver_attempts: u32,
        report: &mut DeploymentReport,
    ) -> Result<()> {
        error!(members = in_flight.len(), %diagnostics, "Group deployment failed");
        for InFlight { mut member, attempt } in in_flight {
            member.error_message = Some(diagnostics.to_string());
            self.ctx.save_member(&mut member, MemberStatus::Failed).await?;
            self.ctx
                .finish_attempt(attempt, false, diagnostics, recovered, driver_attempts)
                .await?;
            report.failed += 1;
            report.failed_members.push(member.id);
        }
        Ok(())
    }
}
