//! Workshop status aggregation.
//!
//! The aggregate is the worst member status, mapped to a workshop status.
//! Lifecycle states (`deploying`, `cleaning_up`) belong to the executor that
//! set them: passive recomputation goes through [`StatusAggregator::propose`],
//! which leaves them alone, while the owning executor holds a
//! [`LifecycleLease`] and is the only one allowed to finalize.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::notify::{publish_quietly, Notifier, WorkshopEvent};
use crate::store::EntityStore;
use crate::workshop::{MemberStatus, WorkshopStatus};

/// Maps member statuses to the aggregate workshop status.
pub fn aggregate<I>(statuses: I) -> WorkshopStatus
where
    I: IntoIterator<Item = MemberStatus>,
{
    let mut seen_any = false;
    let mut worst: Option<MemberStatus> = None;

    for status in statuses {
        seen_any = true;
        let Some(rank) = status.rank() else {
            continue;
        };
        if worst.and_then(MemberStatus::rank).map_or(true, |w| rank < w) {
            worst = Some(status);
        }
    }

    match (seen_any, worst) {
        (false, _) => WorkshopStatus::Pending,
        (true, None) => WorkshopStatus::Completed,
        (true, Some(status)) => status.workshop_status(),
    }
}

pub fn is_lifecycle_state(status: WorkshopStatus) -> bool {
    status.is_lifecycle()
}

/// The value a passive observer may write: the current status when it is a
/// lifecycle state, the fresh aggregate otherwise.
pub fn guarded_aggregate<I>(current: WorkshopStatus, statuses: I) -> WorkshopStatus
where
    I: IntoIterator<Item = MemberStatus>,
{
    if is_lifecycle_state(current) {
        current
    } else {
        aggregate(statuses)
    }
}

/// Diagnostic view comparing the stored status with a fresh computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub workshop_id: String,
    pub current: WorkshopStatus,
    pub computed: WorkshopStatus,
    pub consistent: bool,
    pub breakdown: BTreeMap<MemberStatus, usize>,
}

#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn EntityStore>,
    notifier: Arc<dyn Notifier>,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn EntityStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Guarded recomputation for passive observers. Writes and publishes only
    /// when the value changes.
    pub async fn propose(&self, workshop_id: &str) -> Result<WorkshopStatus> {
        let workshop = self.store.get_workshop(workshop_id).await?;
        if is_lifecycle_state(workshop.status) {
            debug!(workshop_id, status = %workshop.status, "Lifecycle state held, skipping recompute");
            return Ok(workshop.status);
        }

        let members = self.store.list_members(workshop_id).await?;
        let next = guarded_aggregate(workshop.status, members.iter().map(|m| m.status));
        if self.swap(workshop_id, workshop.status, next).await? {
            return Ok(next);
        }

        // Someone else wrote in between, possibly a lifecycle state. Theirs stands.
        let fresh = self.store.get_workshop(workshop_id).await?;
        debug!(workshop_id, status = %fresh.status, "Status changed concurrently, recompute dropped");
        Ok(fresh.status)
    }

    /// Puts the workshop into a lifecycle state and hands the caller the
    /// right to finalize it.
    pub async fn begin(&self, workshop_id: &str, state: WorkshopStatus) -> Result<LifecycleLease> {
        if !is_lifecycle_state(state) {
            return Err(OrchestratorError::InvalidInput(format!(
                "{state} is not a lifecycle state"
            )));
        }

        let workshop = self.store.get_workshop(workshop_id).await?;
        if is_lifecycle_state(workshop.status) && workshop.status != state {
            return Err(OrchestratorError::WorkshopBusy(format!(
                "{workshop_id} is {}, cannot enter {state}",
                workshop.status
            )));
        }
        if !self.swap(workshop_id, workshop.status, state).await? {
            return Err(OrchestratorError::WorkshopBusy(format!(
                "{workshop_id} changed status while entering {state}"
            )));
        }

        Ok(LifecycleLease {
            aggregator: self.clone(),
            workshop_id: workshop_id.to_string(),
            state,
        })
    }

    pub async fn status_check(&self, workshop_id: &str) -> Result<StatusCheck> {
        let workshop = self.store.get_workshop(workshop_id).await?;
        let members = self.store.list_members(workshop_id).await?;

        let mut breakdown = BTreeMap::new();
        for member in &members {
            *breakdown.entry(member.status).or_insert(0) += 1;
        }
        let computed = aggregate(members.iter().map(|m| m.status));

        Ok(StatusCheck {
            workshop_id: workshop_id.to_string(),
            current: workshop.status,
            computed,
            consistent: workshop.status == computed,
            breakdown,
        })
    }

    async fn write(
        &self,
        workshop_id: &str,
        current: WorkshopStatus,
        next: WorkshopStatus,
    ) -> Result<WorkshopStatus> {
        if current == next {
            return Ok(current);
        }

        self.store.set_workshop_status(workshop_id, next).await?;
        self.announce(workshop_id, current, next).await;
        Ok(next)
    }

    /// Compare-and-set write. `false` means the stored status was no longer
    /// `current`.
    async fn swap(
        &self,
        workshop_id: &str,
        current: WorkshopStatus,
        next: WorkshopStatus,
    ) -> Result<bool> {
        if current == next {
            return Ok(true);
        }
        if !self
            .store
            .compare_and_set_status(workshop_id, current, next)
            .await?
        {
            return Ok(false);
        }
        self.announce(workshop_id, current, next).await;
        Ok(true)
    }

    async fn announce(&self, workshop_id: &str, current: WorkshopStatus, next: WorkshopStatus) {
        info!(workshop_id, from = %current, to = %next, "Workshop status changed");
        publish_quietly(
            self.notifier.as_ref(),
            workshop_id,
            WorkshopEvent::StatusChanged {
                from: current,
                to: next,
            },
        )
        .await;
    }
}

/// Proof that the holder put a workshop into a lifecycle state. Only a lease
/// can overwrite that state.
#[must_use = "a lifecycle state stays in place until the lease is finalized"]
pub struct LifecycleLease {
    aggregator: StatusAggregator,
    workshop_id: String,
    state: WorkshopStatus,
}

impl LifecycleLease {
    pub fn workshop_id(&self) -> &str {
        &self.workshop_id
    }

    pub fn state(&self) -> WorkshopStatus {
        self.state
    }

    /// Unguarded recomputation from the current member statuses.
    pub async fn finalize(self) -> Result<WorkshopStatus> {
        let members = self
            .aggregator
            .store
            .list_members(&self.workshop_id)
            .await?;
        let next = aggregate(members.iter().map(|m| m.status));
        self.finalize_as(next).await
    }

    /// Writes `status` regardless of the member statuses.
    pub async fn finalize_as(self, status: WorkshopStatus) -> Result<WorkshopStatus> {
        let workshop = self.aggregator.store.get_workshop(&self.workshop_id).await?;
        self.aggregator
            .write(&self.workshop_id, workshop.status, status)
            .await
    }

    /// Releases the lease without touching the status, leaving the state for
    /// the executor that takes over the workshop.
    pub fn hand_over(self) -> String {
        self.workshop_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use MemberStatus::*;

    fn member_status() -> impl Strategy<Value = MemberStatus> {
        prop_oneof![
            Just(Pending),
            Just(Provisioning),
            Just(Provisioned),
            Just(Failed),
            Just(Removing),
            Just(Removed),
        ]
    }

    #[test]
    fn empty_is_pending() {
        assert_eq!(aggregate(Vec::new()), WorkshopStatus::Pending);
    }

    #[test]
    fn all_removed_is_completed() {
        assert_eq!(aggregate([Removed, Removed]), WorkshopStatus::Completed);
    }

    #[test]
    fn worst_status_wins() {
        assert_eq!(aggregate([Provisioned, Failed, Pending]), WorkshopStatus::Failed);
        assert_eq!(
            aggregate([Provisioned, Removing, Provisioning]),
            WorkshopStatus::CleaningUp
        );
        assert_eq!(
            aggregate([Provisioned, Provisioning, Removed]),
            WorkshopStatus::Deploying
        );
        assert_eq!(aggregate([Provisioned, Pending]), WorkshopStatus::Pending);
        assert_eq!(aggregate([Removed, Provisioned]), WorkshopStatus::Active);
    }

    #[test]
    fn guard_keeps_cleaning_up() {
        assert_eq!(
            guarded_aggregate(WorkshopStatus::CleaningUp, [Provisioned, Provisioned]),
            WorkshopStatus::CleaningUp
        );
        assert_eq!(
            guarded_aggregate(WorkshopStatus::Deploying, [Failed]),
            WorkshopStatus::Deploying
        );
        assert_eq!(
            guarded_aggregate(WorkshopStatus::Active, [Failed]),
            WorkshopStatus::Failed
        );
    }

    proptest! {
        #[test]
        fn all_provisioned_is_active(n in 1usize..20) {
            prop_assert_eq!(aggregate(vec![Provisioned; n]), WorkshopStatus::Active);
        }

        #[test]
        fn all_removed_is_completed_for_any_count(n in 1usize..20) {
            prop_assert_eq!(aggregate(vec![Removed; n]), WorkshopStatus::Completed);
        }

        #[test]
        fn adding_a_worse_status_never_improves(
            statuses in proptest::collection::vec(member_status(), 0..12),
            extra in member_status(),
        ) {
            let before = aggregate(statuses.clone());
            let mut with_extra = statuses.clone();
            with_extra.push(extra);
            let after = aggregate(with_extra);

            let worst_before = statuses.iter().filter_map(|s| s.rank()).min();
            match (extra.rank(), worst_before) {
                // Removed members never change the outcome once others exist.
                (None, Some(_)) => prop_assert_eq!(after, before),
                (Some(r), Some(w)) if r >= w => prop_assert_eq!(after, before),
                (Some(_), _) => prop_assert_eq!(after, extra.workshop_status()),
                (None, None) => prop_assert_eq!(after, WorkshopStatus::Completed),
            }
        }

        #[test]
        fn order_does_not_matter(statuses in proptest::collection::vec(member_status(), 0..12)) {
            let mut reversed = statuses.clone();
            reversed.reverse();
            prop_assert_eq!(aggregate(statuses), aggregate(reversed));
        }

        #[test]
        fn guard_is_idempotent(statuses in proptest::collection::vec(member_status(), 0..12)) {
            for current in [WorkshopStatus::Deploying, WorkshopStatus::CleaningUp] {
                let first = guarded_aggregate(current, statuses.clone());
                let second = guarded_aggregate(first, statuses.clone());
                prop_assert_eq!(first, current);
                prop_assert_eq!(second, first);
            }
        }
    }
}
