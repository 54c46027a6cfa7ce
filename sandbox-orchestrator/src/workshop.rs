use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate status of a workshop.
///
/// `Deploying` and `CleaningUp` are lifecycle states: an executor owns the
/// workshop while it is in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkshopStatus {
    Pending,
    Deploying,
    Active,
    Failed,
    CleaningUp,
    Completed,
}

impl WorkshopStatus {
    pub fn is_lifecycle(self) -> bool {
        matches!(self, WorkshopStatus::Deploying | WorkshopStatus::CleaningUp)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkshopStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkshopStatus::Pending => "pending",
            WorkshopStatus::Deploying => "deploying",
            WorkshopStatus::Active => "active",
            WorkshopStatus::Failed => "failed",
            WorkshopStatus::CleaningUp => "cleaning_up",
            WorkshopStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkshopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single attendee sandbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Provisioning,
    Provisioned,
    Failed,
    Removing,
    Removed,
}

impl MemberStatus {
    /// Aggregation rank, lower is worse. `Removed` members do not take part
    /// in aggregation.
    pub fn rank(self) -> Option<u8> {
        match self {
            MemberStatus::Failed => Some(1),
            MemberStatus::Removing => Some(2),
            MemberStatus::Provisioning => Some(3),
            MemberStatus::Pending => Some(4),
            MemberStatus::Provisioned => Some(5),
            MemberStatus::Removed => None,
        }
    }

    /// The workshop status a member in this state stands for.
    pub fn workshop_status(self) -> WorkshopStatus {
        match self {
            MemberStatus::Failed => WorkshopStatus::Failed,
            MemberStatus::Removing => WorkshopStatus::CleaningUp,
            MemberStatus::Provisioning => WorkshopStatus::Deploying,
            MemberStatus::Pending => WorkshopStatus::Pending,
            MemberStatus::Provisioned => WorkshopStatus::Active,
            MemberStatus::Removed => WorkshopStatus::Completed,
        }
    }

    /// Members the cleanup executor has to destroy.
    pub fn needs_cleanup(self) -> bool {
        matches!(self, MemberStatus::Provisioned | MemberStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Provisioning => "provisioning",
            MemberStatus::Provisioned => "provisioned",
            MemberStatus::Failed => "failed",
            MemberStatus::Removing => "removing",
            MemberStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workshop {
    pub id: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: WorkshopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workshop {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at < now
    }

    pub fn cleanup_due(&self, now: DateTime<Utc>) -> bool {
        self.cleanup_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Whether new work may still be started for this workshop.
    pub fn accepts_deployments(&self) -> bool {
        !matches!(
            self.status,
            WorkshopStatus::CleaningUp | WorkshopStatus::Completed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub workshop_id: String,
    pub name: String,
    pub status: MemberStatus,
    /// Driver workspace of the batch that last provisioned this member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    /// Handles exported by the driver; only populated while provisioned.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_handles: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkshopRequest {
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states() {
        assert!(WorkshopStatus::Deploying.is_lifecycle());
        assert!(WorkshopStatus::CleaningUp.is_lifecycle());
        assert!(!WorkshopStatus::Active.is_lifecycle());
        assert!(!WorkshopStatus::Completed.is_lifecycle());
        assert!(WorkshopStatus::Completed.is_terminal());
    }

    #[test]
    fn ranks_order_worst_first() {
        let mut ranked: Vec<MemberStatus> = [
            MemberStatus::Provisioned,
            MemberStatus::Pending,
            MemberStatus::Failed,
            MemberStatus::Provisioning,
            MemberStatus::Removing,
        ]
        .into_iter()
        .collect();
        ranked.sort_by_key(|s| s.rank());

        assert_eq!(
            ranked,
            vec![
                MemberStatus::Failed,
                MemberStatus::Removing,
                MemberStatus::Provisioning,
                MemberStatus::Pending,
                MemberStatus::Provisioned,
            ]
        );
        assert_eq!(MemberStatus::Removed.rank(), None);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkshopStatus::CleaningUp).unwrap(),
            "\"cleaning_up\""
        );
        assert_eq!(WorkshopStatus::CleaningUp.to_string(), "cleaning_up");
        assert_eq!(
            serde_json::from_str::<MemberStatus>("\"removing\"").unwrap(),
            MemberStatus::Removing
        );
    }
}
