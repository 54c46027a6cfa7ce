use std::sync::Arc;

use chrono::{DateTime, Utc};
use sandbox_driver::ProvisioningDriver;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::aggregator::StatusCheck;
use crate::attempt::AttemptRecord;
use crate::cleanup::CleanupExecutor;
use crate::context::ExecutionContext;
use crate::deploy::BatchDeployer;
use crate::dispatcher::{JobDispatcher, JobHandle, JobKind, JobOutcome};
use crate::error::{OrchestratorError, Result};
use crate::notify::Notifier;
use crate::scheduler::{cleanup_deadline_for, LifecycleScheduler, Sweep};
use crate::settings::OrchestratorSettings;
use crate::sqlite::SqliteStore;
use crate::store::EntityStore;
use crate::workshop::{CreateWorkshopRequest, Member, MemberStatus, Workshop, WorkshopStatus};

/// Entry point for operators and the sweep loop.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: ExecutionContext,
    dispatcher: JobDispatcher,
    deployer: Arc<BatchDeployer>,
    cleaner: Arc<CleanupExecutor>,
    scheduler: LifecycleScheduler,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        driver: Arc<dyn ProvisioningDriver>,
        notifier: Arc<dyn Notifier>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let dispatcher = JobDispatcher::new(settings.worker_pool_size);
        let ctx = ExecutionContext::new(store, driver, notifier, settings);
        let deployer = Arc::new(BatchDeployer::new(ctx.clone()));
        let cleaner = Arc::new(CleanupExecutor::new(ctx.clone()));
        let scheduler =
            LifecycleScheduler::new(ctx.clone(), dispatcher.clone(), Arc::clone(&cleaner));

        Ok(Self {
            ctx,
            dispatcher,
            deployer,
            cleaner,
            scheduler,
        })
    }

    /// Builds an orchestrator over the SQLite store.
    pub fn with_pool(
        pool: SqlitePool,
        driver: Arc<dyn ProvisioningDriver>,
        notifier: Arc<dyn Notifier>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        Self::new(Arc::new(SqliteStore::new(pool)), driver, notifier, settings)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.ctx.settings
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    pub async fn create_workshop(&self, req: CreateWorkshopRequest) -> Result<Workshop> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "workshop name must not be empty".into(),
            ));
        }
        validate_schedule(req.starts_at, req.ends_at)?;

        let now = Utc::now();
        let workshop = Workshop {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            starts_at: req.starts_at,
            ends_at: req.ends_at,
            status: WorkshopStatus::Pending,
            cleanup_deadline: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.store.insert_workshop(&workshop).await?;
        info!(workshop_id = %workshop.id, name = %workshop.name, "Workshop created");

        self.ctx.store.get_workshop(&workshop.id).await
    }

    pub async fn add_member(&self, workshop_id: &str, name: &str) -> Result<Member> {
        let workshop = self.ctx.store.get_workshop(workshop_id).await?;
        if !workshop.accepts_deployments() {
            return Err(OrchestratorError::InvalidState(format!(
                "workshop {workshop_id} is {}",
                workshop.status
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "member name must not be empty".into(),
            ));
        }

        let now = Utc::now();
        let member = Member {
            id: Uuid::new_v4().to_string(),
            workshop_id: workshop_id.to_string(),
            name: name.to_string(),
            status: MemberStatus::Pending,
            deployment_id: None,
            resource_handles: Default::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.store.insert_member(&member).await?;
        self.ctx.aggregator.propose(workshop_id).await?;

        Ok(member)
    }

    /// Moves the workshop window. An existing cleanup deadline follows the
    /// new end time, even if that lowers it.
    pub async fn reschedule(
        &self,
        workshop_id: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Workshop> {
        validate_schedule(starts_at, ends_at)?;
        let workshop = self.ctx.store.get_workshop(workshop_id).await?;
        if !workshop.accepts_deployments() {
            return Err(OrchestratorError::InvalidState(format!(
                "workshop {workshop_id} is {}",
                workshop.status
            )));
        }

        let deadline = workshop
            .cleanup_deadline
            .map(|_| cleanup_deadline_for(ends_at, self.ctx.settings.cleanup_grace()));
        self.ctx
            .store
            .update_schedule(workshop_id, starts_at, ends_at, deadline)
            .await?;
        info!(workshop_id, %starts_at, %ends_at, "Workshop rescheduled");

        self.ctx.store.get_workshop(workshop_id).await
    }

    pub async fn deploy(&self, workshop_id: &str) -> Result<JobHandle> {
        let workshop = self.ctx.store.get_workshop(workshop_id).await?;
        if !workshop.accepts_deployments() {
            return Err(OrchestratorError::InvalidState(format!(
                "workshop {workshop_id} is {}",
                workshop.status
            )));
        }

        let deployer = Arc::clone(&self.deployer);
        let id = workshop_id.to_string();
        Ok(self
            .dispatcher
            .spawn(JobKind::Deploy, workshop_id, move || async move {
                deployer.deploy(&id).await.map(JobOutcome::Deployed)
            }))
    }

    pub async fn cleanup(&self, workshop_id: &str) -> Result<JobHandle> {
        self.ctx.store.get_workshop(workshop_id).await?;

        let cleaner = Arc::clone(&self.cleaner);
        let id = workshop_id.to_string();
        Ok(self
            .dispatcher
            .spawn(JobKind::Cleanup, workshop_id, move || async move {
                cleaner.cleanup(&id).await.map(JobOutcome::Cleaned)
            }))
    }

    /// Queues a new provisioning attempt for a failed member.
    pub async fn retry(&self, member_id: &str) -> Result<JobHandle> {
        let member = self.ctx.store.get_member(member_id).await?;
        if member.status != MemberStatus::Failed {
            return Err(OrchestratorError::InvalidState(format!(
                "member {member_id} is {}, only failed members can be retried",
                member.status
            )));
        }

        let deployer = Arc::clone(&self.deployer);
        let id = member_id.to_string();
        Ok(self
            .dispatcher
            .spawn(JobKind::Retry, &member.workshop_id, move || async move {
                deployer.retry(&id).await.map(JobOutcome::Retried)
            }))
    }

    pub async fn status_check(&self, workshop_id: &str) -> Result<StatusCheck> {
        self.ctx.aggregator.status_check(workshop_id).await
    }

    pub async fn attempts(&self, member_id: &str) -> Result<Vec<AttemptRecord>> {
        self.ctx.store.get_member(member_id).await?;
        self.ctx.store.list_attempts(member_id).await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Sweep> {
        self.scheduler.sweep(now).await
    }

    pub async fn get_workshop(&self, workshop_id: &str) -> Result<Workshop> {
        self.ctx.store.get_workshop(workshop_id).await
    }

    pub async fn list_workshops(&self) -> Result<Vec<Workshop>> {
        self.ctx.store.list_workshops().await
    }

    pub async fn list_members(&self, workshop_id: &str) -> Result<Vec<Member>> {
        self.ctx.store.get_workshop(workshop_id).await?;
        self.ctx.store.list_members(workshop_id).await
    }
}

fn validate_schedule(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    if ends_at < starts_at {
        return Err(OrchestratorError::InvalidInput(format!(
            "workshop ends ({ends_at}) before it starts ({starts_at})"
        )));
    }
    Ok(())
}
