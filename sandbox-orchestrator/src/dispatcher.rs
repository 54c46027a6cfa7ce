use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::cleanup::CleanupReport;
use crate::deploy::DeploymentReport;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Deploy,
    Cleanup,
    Retry,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Deploy => "deploy",
            JobKind::Cleanup => "cleanup",
            JobKind::Retry => "retry",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "report", rename_all = "lowercase")]
pub enum JobOutcome {
    Deployed(DeploymentReport),
    Cleaned(CleanupReport),
    Retried(DeploymentReport),
}

/// A unit of work that has been queued.
#[derive(Debug)]
pub struct JobHandle {
    pub id: String,
    pub kind: JobKind,
    pub workshop_id: String,
    handle: JoinHandle<Result<JobOutcome>>,
}

impl JobHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the job and returns what it reported.
    pub async fn wait(self) -> Result<JobOutcome> {
        self.handle
            .await
            .map_err(|e| OrchestratorError::Job(format!("{} job {}: {e}", self.kind, self.id)))?
    }
}

#[derive(Default)]
struct WorkshopSlot {
    lock: Arc<AsyncMutex<()>>,
    in_flight: usize,
}

type Slots = Arc<Mutex<HashMap<String, WorkshopSlot>>>;

/// Runs units of work on tokio tasks.
///
/// At most `pool_size` jobs run at once. Jobs for the same workshop run one
/// after another in submission order; jobs for different workshops do not
/// wait for each other.
#[derive(Clone)]
pub struct JobDispatcher {
    pool: Arc<Semaphore>,
    slots: Slots,
}

/// Keeps a workshop marked busy until the job holding it is done.
struct InFlightGuard {
    slots: Slots,
    workshop_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(&self.workshop_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if slot.in_flight == 0 {
                slots.remove(&self.workshop_id);
            }
        }
    }
}

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, WorkshopSlot>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

impl JobDispatcher {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a job for this workshop is queued or running.
    pub fn is_busy(&self, workshop_id: &str) -> bool {
        lock_slots(&self.slots)
            .get(workshop_id)
            .is_some_and(|slot| slot.in_flight > 0)
    }

    pub fn in_flight(&self) -> usize {
        lock_slots(&self.slots).values().map(|s| s.in_flight).sum()
    }

    pub fn spawn<F, Fut>(&self, kind: JobKind, workshop_id: &str, job: F) -> JobHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutcome>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let lock = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(workshop_id.to_string()).or_default();
            slot.in_flight += 1;
            Arc::clone(&slot.lock)
        };
        let guard = InFlightGuard {
            slots: Arc::clone(&self.slots),
            workshop_id: workshop_id.to_string(),
        };
        let pool = Arc::clone(&self.pool);
        let span = tracing::info_span!("job", job_id = %id, %kind, workshop_id);

        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                let _workshop = lock.lock_owned().await;
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| OrchestratorError::Job("worker pool closed".into()))?;
                debug!("Job started");
                let outcome = job().await;
                debug!(ok = outcome.is_ok(), "Job finished");
                outcome
            }
            .instrument(span),
        );

        JobHandle {
            id,
            kind,
            workshop_id: workshop_id.to_string(),
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::workshop::WorkshopStatus;

    fn report() -> CleanupReport {
        CleanupReport {
            attempted: 0,
            cleaned: 0,
            failed: 0,
            failed_members: Vec::new(),
            final_status: WorkshopStatus::Completed,
        }
    }

    #[tokio::test]
    async fn same_workshop_jobs_are_serialized() {
        let dispatcher = JobDispatcher::new(4);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(dispatcher.spawn(JobKind::Cleanup, "ws-1", move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(JobOutcome::Cleaned(report()))
            }));
        }
        assert!(dispatcher.is_busy("ws-1"));

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_busy("ws-1"));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_workshops_run_concurrently() {
        let dispatcher = JobDispatcher::new(4);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let handles: Vec<_> = ["ws-1", "ws-2"]
            .into_iter()
            .map(|ws| {
                let barrier = Arc::clone(&barrier);
                dispatcher.spawn(JobKind::Deploy, ws, move || async move {
                    // Both jobs must be running for either to get past here.
                    barrier.wait().await;
                    Ok(JobOutcome::Deployed(DeploymentReport::default()))
                })
            })
            .collect();

        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
                .await
                .expect("jobs for different workshops deadlocked")
                .unwrap();
            assert!(matches!(outcome, JobOutcome::Deployed(_)));
        }
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let dispatcher = JobDispatcher::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                dispatcher.spawn(JobKind::Deploy, &format!("ws-{i}"), move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(JobOutcome::Deployed(DeploymentReport::default()))
                })
            })
            .collect();

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn job_errors_are_returned_from_wait() {
        let dispatcher = JobDispatcher::new(1);
        let handle = dispatcher.spawn(JobKind::Retry, "ws-1", || async {
            Err(OrchestratorError::InvalidState("member m-1 is provisioned".into()))
        });

        assert_eq!(handle.kind, JobKind::Retry);
        assert!(matches!(
            handle.wait().await,
            Err(OrchestratorError::InvalidState(_))
        ));
    }
}
