//! Workshop sandbox lifecycle orchestration
//!
//! Aggregates member statuses into a workshop status, provisions members in
//! quota-sized groups, tears them down one by one, and moves workshops
//! through their time-based states. Provisioning itself is delegated to a
//! [`sandbox_driver::ProvisioningDriver`]. Consumed by the `sandbox-worker`
//! service and CLI.

pub mod aggregator;
pub mod attempt;
pub mod cleanup;
pub mod context;
pub mod db;
pub mod deploy;
pub mod destroyer;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod sqlite;
pub mod store;
pub mod workshop;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use aggregator::{aggregate, guarded_aggregate, LifecycleLease, StatusAggregator, StatusCheck};
pub use attempt::{AttemptAction, AttemptOutcome, AttemptRecord};
pub use cleanup::{CleanupExecutor, CleanupReport};
pub use deploy::{partition, BatchDeployer, DeploymentReport};
pub use destroyer::{DestroyReport, RetryingDestroyer};
pub use dispatcher::{JobDispatcher, JobHandle, JobKind, JobOutcome};
pub use error::{DriverCallError, OrchestratorError, Result};
pub use notify::{BroadcastNotifier, LogNotifier, Notification, Notifier, NotifyError, WorkshopEvent};
pub use orchestrator::Orchestrator;
pub use recovery::{ApplyReport, RecoveringApplier};
pub use retry::{FailureClassifier, FailureKind, RetryOutcome, RetryPolicy};
pub use scheduler::{LifecycleScheduler, Sweep, SweepReport};
pub use settings::OrchestratorSettings;
pub use sqlite::SqliteStore;
pub use store::EntityStore;
pub use workshop::{CreateWorkshopRequest, Member, MemberStatus, Workshop, WorkshopStatus};
