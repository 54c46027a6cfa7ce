use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cleanup::CleanupExecutor;
use crate::context::ExecutionContext;
use crate::dispatcher::{JobDispatcher, JobHandle, JobKind, JobOutcome};
use crate::error::{OrchestratorError, Result};
use crate::workshop::WorkshopStatus;

/// `ends_at + grace`, saturating at the latest representable instant.
pub fn cleanup_deadline_for(ends_at: DateTime<Utc>, grace: chrono::TimeDelta) -> DateTime<Utc> {
    ends_at
        .checked_add_signed(grace)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Workshop ids touched by one sweep, per action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub deadlines_set: Vec<String>,
    pub completed: Vec<String>,
    pub cleanups_started: Vec<String>,
    pub skipped_busy: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.deadlines_set.is_empty()
            && self.completed.is_empty()
            && self.cleanups_started.is_empty()
            && self.skipped_busy.is_empty()
    }
}

#[derive(Debug)]
pub struct Sweep {
    pub report: SweepReport,
    /// Cleanup jobs queued by this sweep.
    pub jobs: Vec<JobHandle>,
}

/// Time-driven transitions. A sweep is idempotent: running it twice with the
/// same clock does nothing the second time.
#[derive(Clone)]
pub struct LifecycleScheduler {
    ctx: ExecutionContext,
    dispatcher: JobDispatcher,
    cleaner: Arc<CleanupExecutor>,
}

impl LifecycleScheduler {
    pub fn new(
        ctx: ExecutionContext,
        dispatcher: JobDispatcher,
        cleaner: Arc<CleanupExecutor>,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            cleaner,
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Sweep> {
        let mut report = SweepReport::default();
        let mut jobs = Vec::new();
        let grace = self.ctx.settings.cleanup_grace();

        for workshop in self.ctx.store.ended_without_deadline(now).await? {
            let deadline = cleanup_deadline_for(workshop.ends_at, grace);
            if self
                .ctx
                .store
                .set_cleanup_deadline(&workshop.id, deadline)
                .await?
            {
                info!(workshop_id = %workshop.id, %deadline, "Cleanup deadline set");
                report.deadlines_set.push(workshop.id);
            }
        }

        for workshop in self.ctx.store.cleanup_due(now).await? {
            if self.dispatcher.is_busy(&workshop.id) {
                debug!(workshop_id = %workshop.id, "Work in flight, cleanup deferred");
                report.skipped_busy.push(workshop.id);
                continue;
            }

            let eligible = self
                .ctx
                .store
                .list_members(&workshop.id)
                .await?
                .iter()
                .filter(|m| m.status.needs_cleanup())
                .count();

            // Another process may hold the workshop in a lifecycle state.
            let lease = match self
                .ctx
                .aggregator
                .begin(&workshop.id, WorkshopStatus::CleaningUp)
                .await
            {
                Ok(lease) => lease,
                Err(OrchestratorError::WorkshopBusy(reason)) => {
                    debug!(workshop_id = %workshop.id, %reason, "Workshop held elsewhere, cleanup deferred");
                    report.skipped_busy.push(workshop.id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if eligible == 0 {
                lease.finalize_as(WorkshopStatus::Completed).await?;
                info!(workshop_id = %workshop.id, "Nothing to clean up, workshop completed");
                report.completed.push(workshop.id);
                continue;
            }

            let workshop_id = lease.hand_over();
            let cleaner = Arc::clone(&self.cleaner);
            let job_workshop = workshop_id.clone();
            jobs.push(
                self.dispatcher
                    .spawn(JobKind::Cleanup, &workshop_id, move || async move {
                        cleaner.cleanup(&job_workshop).await.map(JobOutcome::Cleaned)
                    }),
            );
            info!(%workshop_id, members = eligible, "Cleanup queued");
            report.cleanups_started.push(workshop_id);
        }

        Ok(Sweep { report, jobs })
    }
}
