use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::attempt::{AttemptAction, AttemptOutcome, AttemptRecord};
use crate::error::{OrchestratorError, Result};
use crate::store::EntityStore;
use crate::workshop::{Member, MemberStatus, Workshop, WorkshopStatus};

/// `EntityStore` backed by the SQLite pool from [`crate::db::create_pool`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn insert_workshop(&self, workshop: &Workshop) -> Result<()> {
        sqlx::query(
            "INSERT INTO workshops (id, name, starts_at, ends_at, status, cleanup_deadline, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workshop.id)
        .bind(&workshop.name)
        .bind(workshop.starts_at.timestamp())
        .bind(workshop.ends_at.timestamp())
        .bind(workshop.status)
        .bind(workshop.cleanup_deadline.map(|dt| dt.timestamp()))
        .bind(workshop.created_at.timestamp())
        .bind(workshop.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workshop(&self, id: &str) -> Result<Workshop> {
        sqlx::query_as::<_, WorkshopRow>("SELECT * FROM workshops WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::WorkshopNotFound(id.to_string()))?
            .try_into()
    }

    async fn list_workshops(&self) -> Result<Vec<Workshop>> {
        let rows = sqlx::query_as::<_, WorkshopRow>(
            "SELECT * FROM workshops ORDER BY starts_at, created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workshop::try_from).collect()
    }

    async fn set_workshop_status(&self, id: &str, status: WorkshopStatus) -> Result<()> {
        let result = sqlx::query("UPDATE workshops SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::WorkshopNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: WorkshopStatus,
        next: WorkshopStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workshops SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a lost race from an unknown id.
        self.get_workshop(id).await?;
        Ok(false)
    }

    async fn set_cleanup_deadline(&self, id: &str, deadline: DateTime<Utc>) -> Result<bool> {
        let ts = deadline.timestamp();
        let result = sqlx::query(
            "UPDATE workshops SET cleanup_deadline = ?, updated_at = ?
             WHERE id = ? AND (cleanup_deadline IS NULL OR cleanup_deadline < ?)",
        )
        .bind(ts)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_schedule(
        &self,
        id: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        cleanup_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workshops SET starts_at = ?, ends_at = ?, cleanup_deadline = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(starts_at.timestamp())
        .bind(ends_at.timestamp())
        .bind(cleanup_deadline.map(|dt| dt.timestamp()))
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::WorkshopNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn ended_without_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        let rows = sqlx::query_as::<_, WorkshopRow>(
            "SELECT * FROM workshops
             WHERE ends_at < ? AND cleanup_deadline IS NULL
               AND status NOT IN ('deploying', 'cleaning_up', 'completed')
             ORDER BY ends_at, created_at",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workshop::try_from).collect()
    }

    async fn cleanup_due(&self, now: DateTime<Utc>) -> Result<Vec<Workshop>> {
        let rows = sqlx::query_as::<_, WorkshopRow>(
            "SELECT * FROM workshops
             WHERE cleanup_deadline IS NOT NULL AND cleanup_deadline <= ?
               AND status NOT IN ('cleaning_up', 'completed')
             ORDER BY cleanup_deadline, created_at",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workshop::try_from).collect()
    }

    async fn insert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            "INSERT INTO members (id, workshop_id, name, status, deployment_id, resource_handles, error_message, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&member.id)
        .bind(&member.workshop_id)
        .bind(&member.name)
        .bind(member.status)
        .bind(&member.deployment_id)
        .bind(encode_handles(&member.resource_handles)?)
        .bind(&member.error_message)
        .bind(member.created_at.timestamp())
        .bind(member.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_member(&self, id: &str) -> Result<Member> {
        sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::MemberNotFound(id.to_string()))?
            .try_into()
    }

    async fn list_members(&self, workshop_id: &str) -> Result<Vec<Member>> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE workshop_id = ? ORDER BY created_at, rowid",
        )
        .bind(workshop_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Member::try_from).collect()
    }

    async fn update_member(&self, member: &Member) -> Result<()> {
        let result = sqlx::query(
            "UPDATE members
             SET status = ?, deployment_id = ?, resource_handles = ?, error_message = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(member.status)
        .bind(&member.deployment_id)
        .bind(encode_handles(&member.resource_handles)?)
        .bind(&member.error_message)
        .bind(member.updated_at.timestamp())
        .bind(&member.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::MemberNotFound(member.id.clone()));
        }
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO attempts (id, member_id, workshop_id, action, outcome, started_at, finished_at, diagnostics, recovered, driver_attempts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.id)
        .bind(&attempt.member_id)
        .bind(&attempt.workshop_id)
        .bind(attempt.action)
        .bind(attempt.outcome)
        .bind(attempt.started_at.timestamp())
        .bind(attempt.finished_at.map(|dt| dt.timestamp()))
        .bind(&attempt.diagnostics)
        .bind(attempt.recovered)
        .bind(i64::from(attempt.driver_attempts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_attempt(&self, attempt: &AttemptRecord) -> Result<()> {
        if attempt.is_running() {
            return Err(OrchestratorError::InvalidState(format!(
                "attempt {} has no outcome to record",
                attempt.id
            )));
        }

        let result = sqlx::query(
            "UPDATE attempts
             SET outcome = ?, finished_at = ?, diagnostics = ?, recovered = ?, driver_attempts = ?
             WHERE id = ? AND outcome = 'running'",
        )
        .bind(attempt.outcome)
        .bind(attempt.finished_at.map(|dt| dt.timestamp()))
        .bind(&attempt.diagnostics)
        .bind(attempt.recovered)
        .bind(i64::from(attempt.driver_attempts))
        .bind(&attempt.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "attempt {} is not running",
                attempt.id
            )));
        }
        Ok(())
    }

    async fn list_attempts(&self, member_id: &str) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM attempts WHERE member_id = ? ORDER BY started_at, rowid",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRecord::try_from).collect()
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkshopRow {
    id: String,
    name: String,
    starts_at: i64,
    ends_at: i64,
    status: WorkshopStatus,
    cleanup_deadline: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    id: String,
    workshop_id: String,
    name: String,
    status: MemberStatus,
    deployment_id: Option<String>,
    resource_handles: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    member_id: String,
    workshop_id: String,
    action: AttemptAction,
    outcome: AttemptOutcome,
    started_at: i64,
    finished_at: Option<i64>,
    diagnostics: Option<String>,
    recovered: bool,
    driver_attempts: i64,
}

impl TryFrom<WorkshopRow> for Workshop {
    type Error = OrchestratorError;

    fn try_from(row: WorkshopRow) -> Result<Self> {
        Ok(Self {
            starts_at: timestamp(row.starts_at)?,
            ends_at: timestamp(row.ends_at)?,
            status: row.status,
            cleanup_deadline: row.cleanup_deadline.map(timestamp).transpose()?,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
            id: row.id,
            name: row.name,
        })
    }
}

impl TryFrom<MemberRow> for Member {
    type Error = OrchestratorError;

    fn try_from(row: MemberRow) -> Result<Self> {
        let resource_handles = match row.resource_handles.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => BTreeMap::new(),
        };

        Ok(Self {
            status: row.status,
            resource_handles,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
            id: row.id,
            workshop_id: row.workshop_id,
            name: row.name,
            deployment_id: row.deployment_id,
            error_message: row.error_message,
        })
    }
}

impl TryFrom<AttemptRow> for AttemptRecord {
    type Error = OrchestratorError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let driver_attempts = u32::try_from(row.driver_attempts).map_err(|_| {
            OrchestratorError::InvalidData(format!(
                "attempt {} has driver_attempts {}",
                row.id, row.driver_attempts
            ))
        })?;

        Ok(Self {
            action: row.action,
            outcome: row.outcome,
            started_at: timestamp(row.started_at)?,
            finished_at: row.finished_at.map(timestamp).transpose()?,
            recovered: row.recovered,
            driver_attempts,
            id: row.id,
            member_id: row.member_id,
            workshop_id: row.workshop_id,
            diagnostics: row.diagnostics,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| OrchestratorError::InvalidData(format!("timestamp out of range: {secs}")))
}

fn encode_handles(handles: &BTreeMap<String, String>) -> Result<Option<String>> {
    if handles.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(handles)?))
}
