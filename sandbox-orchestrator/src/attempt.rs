use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workshop::Member;

/// One state-changing operation on a member. Inserted as `Running` and
/// completed exactly once; a retry is a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: String,
    pub member_id: String,
    pub workshop_id: String,
    pub action: AttemptAction,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub diagnostics: Option<String>,
    /// A stale-reference recovery cycle ran during this attempt.
    pub recovered: bool,
    /// Driver calls made for the operation itself (destroy retries included).
    pub driver_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AttemptAction {
    Deploy,
    Retry,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Running,
    Succeeded,
    Failed,
}

impl AttemptRecord {
    pub fn start(member: &Member, action: AttemptAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            member_id: member.id.clone(),
            workshop_id: member.workshop_id.clone(),
            action,
            outcome: AttemptOutcome::Running,
            started_at: Utc::now(),
            finished_at: None,
            diagnostics: None,
            recovered: false,
            driver_attempts: 0,
        }
    }

    /// Consumes the running record and returns its completed form.
    pub fn finish(
        self,
        succeeded: bool,
        diagnostics: impl Into<String>,
        recovered: bool,
        driver_attempts: u32,
    ) -> Self {
        let diagnostics: String = diagnostics.into();
        Self {
            outcome: if succeeded {
                AttemptOutcome::Succeeded
            } else {
                AttemptOutcome::Failed
            },
            finished_at: Some(Utc::now()),
            diagnostics: (!diagnostics.is_empty()).then_some(diagnostics),
            recovered,
            driver_attempts,
            ..self
        }
    }

    pub fn is_running(&self) -> bool {
        self.outcome == AttemptOutcome::Running
    }
}
