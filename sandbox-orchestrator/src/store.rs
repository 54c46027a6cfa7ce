use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::attempt::AttemptRecord;
use crate::error::Result;
use crate::workshop::{Member, Workshop, WorkshopStatus};

/// Persistence boundary for workshops, members and attempt records.
///
/// Lookups of unknown ids return `WorkshopNotFound` / `MemberNotFound`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_workshop(&self, workshop: &Workshop) -> Result<()>;

    async fn get_workshop(&self, id: &str) -> Result<Workshop>;

    async fn list_workshops(&self) -> Result<Vec<Workshop>>;

    async fn set_workshop_status(&self, id: &str, status: WorkshopStatus) -> Result<()>;

    /// Writes `next` only if the stored status is still `expected`. Returns
    /// whether the row changed; another writer got there first otherwise.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: WorkshopStatus,
        next: WorkshopStatus,
    ) -> Result<bool>;

    /// Raises the cleanup deadline; a value lower than the stored one is
    /// ignored. Returns whether a row changed.
    async fn set_cleanup_deadline(&self, id: &str, deadline: DateTime<Utc>) -> Result<bool>;

    /// Writes a new schedule. `cleanup_deadline` replaces the stored deadline
    /// as is, which is the only way to lower it.
    async fn update_schedule(
        &self,
        id: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        cleanup_deadline: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Workshops that ended before `now`, have no deadline yet and are
    /// neither in a lifecycle state nor completed.
    async fn ended_without_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>>;

    /// Workshops whose deadline is at or before `now` and which are not
    /// already cleaning up or completed.
    async fn cleanup_due(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>>;

    async fn insert_member(&self, member: &Member) -> Result<()>;

    async fn get_member(&self, id: &str) -> Result<Member>;

    /// Members of a workshop in stable creation order.
    async fn list_members(&self, workshop_id: &str) -> Result<Vec<Member>>;

    /// Persists status, deployment id, handles and error message.
    async fn update_member(&self, member: &Member) -> Result<()>;

    async fn insert_attempt(&self, attempt: &AttemptRecord) -> Result<()>;

    /// Completes a running attempt. Fails with `InvalidState` if the record
    /// is not running any more.
    async fn complete_attempt(&self, attempt: &AttemptRecord) -> Result<()>;

    /// Attempt records of a member, oldest first.
    async fn list_attempts(&self, member_id: &str) -> Result<Vec<AttemptRecord>>;
}
