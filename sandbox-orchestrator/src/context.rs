use std::sync::Arc;

use chrono::Utc;
use sandbox_driver::ProvisioningDriver;
use tracing::debug;

use crate::aggregator::StatusAggregator;
use crate::attempt::{AttemptAction, AttemptRecord};
use crate::error::Result;
use crate::notify::{publish_quietly, Notifier, WorkshopEvent};
use crate::runner::DriverRunner;
use crate::settings::OrchestratorSettings;
use crate::store::EntityStore;
use crate::workshop::{Member, MemberStatus};

/// Everything an executor needs, cheap to clone into jobs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub store: Arc<dyn EntityStore>,
    pub runner: DriverRunner,
    pub notifier: Arc<dyn Notifier>,
    pub aggregator: StatusAggregator,
    pub settings: Arc<OrchestratorSettings>,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn EntityStore>,
        driver: Arc<dyn ProvisioningDriver>,
        notifier: Arc<dyn Notifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        let aggregator = StatusAggregator::new(Arc::clone(&store), Arc::clone(&notifier));
        Self {
            store,
            runner: DriverRunner::new(driver),
            notifier,
            aggregator,
            settings: Arc::new(settings),
        }
    }

    /// Persists the member, publishes the change and lets the aggregator
    /// recompute. The recompute is guarded, so it is a no-op while the
    /// workshop is in a lifecycle state.
    pub async fn save_member(&self, member: &mut Member, status: MemberStatus) -> Result<()> {
        member.status = status;
        member.updated_at = Utc::now();
        self.store.update_member(member).await?;
        debug!(member_id = %member.id, %status, "Member status saved");

        publish_quietly(
            self.notifier.as_ref(),
            &member.workshop_id,
            WorkshopEvent::MemberStatusChanged {
                member_id: member.id.clone(),
                status,
            },
        )
        .await;
        self.aggregator.propose(&member.workshop_id).await?;
        Ok(())
    }

    pub async fn start_attempt(
        &self,
        member: &Member,
        action: AttemptAction,
    ) -> Result<AttemptRecord> {
        let attempt = AttemptRecord::start(member, action);
        self.store.insert_attempt(&attempt).await?;
        Ok(attempt)
    }

    pub async fn finish_attempt(
        &self,
        attempt: AttemptRecord,
        succeeded: bool,
        diagnostics: &str,
        recovered: bool,
        driver_attempts: u32,
    ) -> Result<AttemptRecord> {
        let attempt = attempt.finish(succeeded, diagnostics, recovered, driver_attempts);
        self.store.complete_attempt(&attempt).await?;
        Ok(attempt)
    }
}
