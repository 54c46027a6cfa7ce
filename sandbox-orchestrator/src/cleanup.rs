use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::attempt::AttemptAction;
use crate::context::ExecutionContext;
use crate::destroyer::RetryingDestroyer;
use crate::error::Result;
use crate::notify::{publish_quietly, WorkshopEvent};
use crate::retry::RetryPolicy;
use crate::workshop::{MemberStatus, WorkshopStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub attempted: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub failed_members: Vec<String>,
    pub final_status: WorkshopStatus,
}

/// Destroys a workshop's members one at a time.
///
/// A failed member does not stop the loop and does not keep the workshop
/// from completing; it stays `failed` with the diagnostics on its attempt
/// record so a later cleanup can pick it up again.
pub struct CleanupExecutor {
    ctx: ExecutionContext,
    destroyer: RetryingDestroyer,
}

impl CleanupExecutor {
    pub fn new(ctx: ExecutionContext) -> Self {
        let destroyer = RetryingDestroyer::new(
            ctx.runner.clone(),
            RetryPolicy::destruction(&ctx.settings),
        );
        Self { ctx, destroyer }
    }

    #[instrument(skip(self))]
    pub async fn cleanup(&self, workshop_id: &str) -> Result<CleanupReport> {
        let lease = self
            .ctx
            .aggregator
            .begin(workshop_id, WorkshopStatus::CleaningUp)
            .await?;

        let members: Vec<_> = self
            .ctx
            .store
            .list_members(workshop_id)
            .await?
            .into_iter()
            .filter(|m| m.status.needs_cleanup())
            .collect();
        info!(members = members.len(), "Starting workshop cleanup");

        let mut cleaned = 0;
        let mut failed_members = Vec::new();
        let attempted = members.len();

        for mut member in members {
            self.ctx
                .save_member(&mut member, MemberStatus::Removing)
                .await?;
            let attempt = self
                .ctx
                .start_attempt(&member, AttemptAction::Destroy)
                .await?;

            // The driver resolves a member id to the deployment declaring it.
            let report = self.destroyer.destroy(&member.id).await;

            if report.ok {
                member.resource_handles.clear();
                member.error_message = None;
                self.ctx
                    .save_member(&mut member, MemberStatus::Removed)
                    .await?;
                cleaned += 1;
            } else {
                warn!(member_id = %member.id, "Member cleanup failed, continuing");
                member.error_message = Some(report.diagnostics.clone());
                self.ctx.save_member(&mut member, MemberStatus::Failed).await?;
                failed_members.push(member.id.clone());
            }

            self.ctx
                .finish_attempt(attempt, report.ok, &report.diagnostics, false, report.attempts)
                .await?;
        }

        let final_status = lease.finalize_as(WorkshopStatus::Completed).await?;
        let failed = failed_members.len();
        if failed > 0 {
            warn!(cleaned, failed, "Workshop completed with members left behind");
        } else {
            info!(cleaned, "Workshop cleanup finished");
        }
        publish_quietly(
            self.ctx.notifier.as_ref(),
            workshop_id,
            WorkshopEvent::CleanupFinished { cleaned, failed },
        )
        .await;

        Ok(CleanupReport {
            attempted,
            cleaned,
            failed,
            failed_members,
            final_status,
        })
    }
}
