//! Integration tests for the sweep loop
//!
//! Runs single sweeps against the mock driver and checks that due workshops
//! are cleaned up and that the loop keeps going between ticks.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sandbox_orchestrator::test_utils::TestHarness;
use sandbox_orchestrator::{CreateWorkshopRequest, MemberStatus, Workshop, WorkshopStatus};
use sandbox_worker::{report_job, run_sweep_once, start_sweeper_task};

/// A workshop that ended `hours_ago` hours ago.
async fn finished_workshop(h: &TestHarness, hours_ago: i64, members: usize) -> Workshop {
    let now = Utc::now();
    let workshop = h
        .orchestrator
        .create_workshop(CreateWorkshopRequest {
            name: "Intro to IAM".into(),
            starts_at: now - Duration::hours(hours_ago + 3),
            ends_at: now - Duration::hours(hours_ago),
        })
        .await
        .unwrap();
    for i in 0..members {
        h.orchestrator
            .add_member(&workshop.id, &format!("attendee-{i}"))
            .await
            .unwrap();
    }
    workshop
}

#[tokio::test]
async fn test_sweep_within_grace_only_sets_deadline() {
    let h = TestHarness::new().await;
    let workshop = finished_workshop(&h, 1, 1).await;

    let sweep = run_sweep_once(&h.orchestrator).await.unwrap();
    assert_eq!(sweep.report.deadlines_set, vec![workshop.id.clone()]);
    assert!(sweep.report.cleanups_started.is_empty());
    assert!(sweep.jobs.is_empty());
}

#[tokio::test]
async fn test_sweep_past_grace_cleans_up_deployed_members() {
    let h = TestHarness::new().await;
    let workshop = finished_workshop(&h, 5, 2).await;
    h.orchestrator
        .deploy(&workshop.id)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Deadline already behind us: set and acted on in the same pass.
    let sweep = run_sweep_once(&h.orchestrator).await.unwrap();
    assert_eq!(sweep.report.deadlines_set, vec![workshop.id.clone()]);
    assert_eq!(sweep.report.cleanups_started, vec![workshop.id.clone()]);

    for job in sweep.jobs {
        report_job(job).await;
    }

    assert_eq!(
        h.orchestrator.get_workshop(&workshop.id).await.unwrap().status,
        WorkshopStatus::Completed
    );
    assert_eq!(h.driver.count("destroy"), 2);
    for member in h.orchestrator.list_members(&workshop.id).await.unwrap() {
        assert_eq!(member.status, MemberStatus::Removed);
    }
}

#[tokio::test]
async fn test_sweeper_task_completes_empty_workshop() {
    let h = TestHarness::new().await;
    let workshop = finished_workshop(&h, 5, 0).await;

    let task = tokio::spawn(start_sweeper_task(h.orchestrator.clone(), 1));

    let mut status = WorkshopStatus::Pending;
    for _ in 0..30 {
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        status = h.orchestrator.get_workshop(&workshop.id).await.unwrap().status;
        if status == WorkshopStatus::Completed {
            break;
        }
    }
    task.abort();

    assert_eq!(status, WorkshopStatus::Completed);
}
