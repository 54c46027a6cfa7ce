use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::deploy::DeploymentReport;
use crate::workshop::{MemberStatus, WorkshopStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkshopEvent {
    StatusChanged {
        from: WorkshopStatus,
        to: WorkshopStatus,
    },
    MemberStatusChanged {
        member_id: String,
        status: MemberStatus,
    },
    DeploymentFinished {
        report: DeploymentReport,
    },
    CleanupFinished {
        cleaned: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub workshop_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WorkshopEvent,
}

impl Notification {
    pub fn new(workshop_id: impl Into<String>, event: WorkshopEvent) -> Self {
        Self {
            workshop_id: workshop_id.into(),
            at: Utc::now(),
            event,
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound channel for workshop updates. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Publishes and logs delivery failures instead of returning them.
pub async fn publish_quietly(notifier: &dyn Notifier, workshop_id: &str, event: WorkshopEvent) {
    let notification = Notification::new(workshop_id, event);
    if let Err(e) = notifier.publish(&notification).await {
        warn!(workshop_id, error = %e, "Failed to publish workshop notification");
    }
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(&notification.event)
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        info!(workshop_id = %notification.workshop_id, event = %payload, "workshop event");
        Ok(())
    }
}

/// Fans notifications out to every subscriber of a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        // No subscribers is not a delivery failure.
        if self.sender.receiver_count() == 0 {
            debug!(workshop_id = %notification.workshop_id, "No notification subscribers");
            return Ok(());
        }
        self.sender
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn publish(&self, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("socket closed".into()))
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        publish_quietly(
            &notifier,
            "ws-1",
            WorkshopEvent::StatusChanged {
                from: WorkshopStatus::Pending,
                to: WorkshopStatus::Deploying,
            },
        )
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.workshop_id, "ws-1");
        assert_eq!(
            received.event,
            WorkshopEvent::StatusChanged {
                from: WorkshopStatus::Pending,
                to: WorkshopStatus::Deploying,
            }
        );
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_ok() {
        let notifier = BroadcastNotifier::new(1);
        let notification = Notification::new(
            "ws-1",
            WorkshopEvent::CleanupFinished {
                cleaned: 1,
                failed: 0,
            },
        );
        assert!(notifier.publish(&notification).await.is_ok());
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        publish_quietly(
            &FailingNotifier,
            "ws-1",
            WorkshopEvent::CleanupFinished {
                cleaned: 0,
                failed: 0,
            },
        )
        .await;
    }

    #[test]
    fn events_are_tagged() {
        let notification = Notification::new(
            "ws-9",
            WorkshopEvent::MemberStatusChanged {
                member_id: "m-1".into(),
                status: MemberStatus::Provisioned,
            },
        );
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["event"], "member_status_changed");
        assert_eq!(json["workshop_id"], "ws-9");
        assert_eq!(json["status"], "provisioned");
    }
}
