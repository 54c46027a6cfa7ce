use anyhow::Result;
use chrono::Utc;
use sandbox_orchestrator::{JobHandle, JobOutcome, Orchestrator, Sweep};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Runs a sweep every `interval_secs` until the task is dropped.
pub async fn start_sweeper_task(orchestrator: Orchestrator, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Sweeper task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match run_sweep_once(&orchestrator).await {
            Ok(sweep) => {
                for job in sweep.jobs {
                    tokio::spawn(report_job(job));
                }
            }
            Err(e) => error!("Lifecycle sweep failed: {}", e),
        }
    }
}

/// One pass of the lifecycle scheduler against the wall clock.
pub async fn run_sweep_once(orchestrator: &Orchestrator) -> Result<Sweep> {
    let sweep = orchestrator.sweep(Utc::now()).await?;
    let report = &sweep.report;

    if !report.is_empty() {
        info!(
            deadlines_set = report.deadlines_set.len(),
            completed = report.completed.len(),
            cleanups_started = report.cleanups_started.len(),
            skipped_busy = report.skipped_busy.len(),
            "Lifecycle sweep finished"
        );
    }
    for workshop_id in &report.skipped_busy {
        warn!("Cleanup of {} postponed, workshop has a job in flight", workshop_id);
    }

    Ok(sweep)
}

/// Waits for a queued job and logs its outcome.
pub async fn report_job(job: JobHandle) {
    let (id, workshop_id) = (job.id.clone(), job.workshop_id.clone());
    match job.wait().await {
        Ok(JobOutcome::Cleaned(report)) => info!(
            job = %id,
            workshop = %workshop_id,
            cleaned = report.cleaned,
            failed = report.failed,
            status = %report.final_status,
            "Scheduled cleanup finished"
        ),
        Ok(outcome) => info!(job = %id, workshop = %workshop_id, ?outcome, "Job finished"),
        Err(e) => error!("Job {} for workshop {} failed: {}", id, workshop_id, e),
    }
}
