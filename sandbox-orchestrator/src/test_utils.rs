use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sandbox_driver::mock::MockDriver;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::attempt::AttemptRecord;
use crate::error::{OrchestratorError, Result};
use crate::notify::{Notification, Notifier, NotifyError, WorkshopEvent};
use crate::orchestrator::Orchestrator;
use crate::settings::OrchestratorSettings;
use crate::sqlite::SqliteStore;
use crate::store::EntityStore;
use crate::workshop::{CreateWorkshopRequest, Member, Workshop, WorkshopStatus};

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to `sqlite::memory:` is a separate database, so the
    // pool must never open a second one.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Settings for tests: production values without the group cooldown.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        group_cooldown_secs: 0,
        ..Default::default()
    }
}

/// Entity store held in memory. Never touches I/O, so it works on a
/// paused tokio clock where the sqlite pool's own timeouts would fire.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    workshops: Vec<Workshop>,
    members: Vec<Member>,
    attempts: Vec<AttemptRecord>,
}

impl MemoryStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl MemoryState {
    fn workshop_mut(&mut self, id: &str) -> Result<&mut Workshop> {
        self.workshops
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| OrchestratorError::WorkshopNotFound(id.to_string()))
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_workshop(&self, workshop: &Workshop) -> Result<()> {
        self.with_state(|s| s.workshops.push(workshop.clone()));
        Ok(())
    }

    async fn get_workshop(&self, id: &str) -> Result<Workshop> {
        self.with_state(|s| s.workshop_mut(id).map(|w| w.clone()))
    }

    async fn list_workshops(&self) -> Result<Vec<Workshop>> {
        let mut workshops = self.with_state(|s| s.workshops.clone());
        workshops.sort_by_key(|w| w.starts_at);
        Ok(workshops)
    }

    async fn set_workshop_status(&self, id: &str, status: WorkshopStatus) -> Result<()> {
        self.with_state(|s| {
            let workshop = s.workshop_mut(id)?;
            workshop.status = status;
            workshop.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: WorkshopStatus,
        next: WorkshopStatus,
    ) -> Result<bool> {
        self.with_state(|s| {
            let workshop = s.workshop_mut(id)?;
            if workshop.status != expected {
                return Ok(false);
            }
            workshop.status = next;
            workshop.updated_at = Utc::now();
            Ok(true)
        })
    }

    async fn set_cleanup_deadline(&self, id: &str, deadline: DateTime<Utc>) -> Result<bool> {
        self.with_state(|s| {
            let Ok(workshop) = s.workshop_mut(id) else {
                return Ok(false);
            };
            if workshop.cleanup_deadline.is_some_and(|d| d >= deadline) {
                return Ok(false);
            }
            workshop.cleanup_deadline = Some(deadline);
            Ok(true)
        })
    }

    async fn update_schedule(
        &self,
        id: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        cleanup_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_state(|s| {
            let workshop = s.workshop_mut(id)?;
            workshop.starts_at = starts_at;
            workshop.ends_at = ends_at;
            workshop.cleanup_deadline = cleanup_deadline;
            Ok(())
        })
    }

    async fn ended_without_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        Ok(self.with_state(|s| {
            s.workshops
                .iter()
                .filter(|w| w.ends_at < now && w.cleanup_deadline.is_none())
                .filter(|w| !w.status.is_lifecycle() && w.status != WorkshopStatus::Completed)
                .cloned()
                .collect()
        }))
    }

    async fn cleanup_due(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        Ok(self.with_state(|s| {
            s.workshops
                .iter()
                .filter(|w| w.cleanup_deadline.is_some_and(|d| d <= now))
                .filter(|w| {
                    !matches!(
                        w.status,
                        WorkshopStatus::CleaningUp | WorkshopStatus::Completed
                    )
                })
                .cloned()
                .collect()
        }))
    }

    async fn insert_member(&self, member: &Member) -> Result<()> {
        self.with_state(|s| s.members.push(member.clone()));
        Ok(())
    }

    async fn get_member(&self, id: &str) -> Result<Member> {
        self.with_state(|s| {
            s.members
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| OrchestratorError::MemberNotFound(id.to_string()))
        })
    }

    async fn list_members(&self, workshop_id: &str) -> Result<Vec<Member>> {
        Ok(self.with_state(|s| {
            s.members
                .iter()
                .filter(|m| m.workshop_id == workshop_id)
                .cloned()
                .collect()
        }))
    }

    async fn update_member(&self, member: &Member) -> Result<()> {
        self.with_state(|s| {
            let stored = s
                .members
                .iter_mut()
                .find(|m| m.id == member.id)
                .ok_or_else(|| OrchestratorError::MemberNotFound(member.id.clone()))?;
            *stored = member.clone();
            Ok(())
        })
    }

    async fn insert_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        self.with_state(|s| s.attempts.push(attempt.clone()));
        Ok(())
    }

    async fn complete_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        self.with_state(|s| {
            let stored = s
                .attempts
                .iter_mut()
                .find(|a| a.id == attempt.id && a.is_running())
                .filter(|_| !attempt.is_running())
                .ok_or_else(|| {
                    OrchestratorError::InvalidState(format!(
                        "attempt {} is not running",
                        attempt.id
                    ))
                })?;
            *stored = attempt.clone();
            Ok(())
        })
    }

    async fn list_attempts(&self, member_id: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self.with_state(|s| {
            s.attempts
                .iter()
                .filter(|a| a.member_id == member_id)
                .cloned()
                .collect()
        }))
    }
}

/// Keeps every notification it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `(from, to)` pairs of every status change published for a workshop.
    pub fn status_changes(&self, workshop_id: &str) -> Vec<(WorkshopStatus, WorkshopStatus)> {
        self.notifications()
            .into_iter()
            .filter(|n| n.workshop_id == workshop_id)
            .filter_map(|n| match n.event {
                WorkshopEvent::StatusChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: &Notification) -> std::result::Result<(), NotifyError> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

/// An orchestrator over an in-memory database and a scripted driver.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub store: Arc<SqliteStore>,
    pub driver: Arc<MockDriver>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: OrchestratorSettings) -> Self {
        let store = Arc::new(SqliteStore::new(create_test_db().await));
        let driver = Arc::new(MockDriver::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = Orchestrator::new(
            store.clone(),
            driver.clone(),
            notifier.clone(),
            settings,
        )
        .expect("test settings are valid");

        Self {
            orchestrator,
            store,
            driver,
            notifier,
        }
    }

    /// A workshop running from an hour ago to an hour from now, with
    /// `members` pending attendees.
    pub async fn seed_workshop(&self, members: usize) -> (Workshop, Vec<Member>) {
        let now = Utc::now();
        let workshop = self
            .orchestrator
            .create_workshop(CreateWorkshopRequest {
                name: "Terraform 101".into(),
                starts_at: now - Duration::hours(1),
                ends_at: now + Duration::hours(1),
            })
            .await
            .expect("Failed to create workshop");

        let mut seeded = Vec::with_capacity(members);
        for i in 0..members {
            let member = self
                .orchestrator
                .add_member(&workshop.id, &format!("attendee-{i}"))
                .await
                .expect("Failed to add member");
            seeded.push(member);
        }

        (workshop, seeded)
    }
}
