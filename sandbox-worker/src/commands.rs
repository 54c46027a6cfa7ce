use anyhow::Result;
use sandbox_orchestrator::{CreateWorkshopRequest, Orchestrator};
use serde_json::{json, Value};
use tracing::info;

use crate::cli::Command;
use crate::sweeper::run_sweep_once;

/// Runs a one-shot command and returns what it produced as JSON.
/// Jobs are awaited so the process can exit once the command returns.
pub async fn execute(orchestrator: &Orchestrator, command: Command) -> Result<Value> {
    let value = match command {
        Command::Serve { .. } => anyhow::bail!("serve is not a one-shot command"),
        Command::Sweep => {
            let sweep = run_sweep_once(orchestrator).await?;
            let mut outcomes = Vec::with_capacity(sweep.jobs.len());
            for job in sweep.jobs {
                let workshop_id = job.workshop_id.clone();
                let outcome = job.wait().await?;
                outcomes.push(json!({ "workshop_id": workshop_id, "outcome": outcome }));
            }
            json!({ "report": sweep.report, "jobs": outcomes })
        }
        Command::CreateWorkshop {
            name,
            starts_at,
            ends_at,
        } => {
            let workshop = orchestrator
                .create_workshop(CreateWorkshopRequest {
                    name,
                    starts_at,
                    ends_at,
                })
                .await?;
            info!("Created workshop {} ({})", workshop.name, workshop.id);
            serde_json::to_value(workshop)?
        }
        Command::Reschedule {
            workshop_id,
            starts_at,
            ends_at,
        } => serde_json::to_value(
            orchestrator
                .reschedule(&workshop_id, starts_at, ends_at)
                .await?,
        )?,
        Command::AddMember { workshop_id, name } => {
            serde_json::to_value(orchestrator.add_member(&workshop_id, &name).await?)?
        }
        Command::Deploy { workshop_id } => {
            let job = orchestrator.deploy(&workshop_id).await?;
            info!("Deployment job {} queued for {}", job.id, workshop_id);
            serde_json::to_value(job.wait().await?)?
        }
        Command::Cleanup { workshop_id } => {
            let job = orchestrator.cleanup(&workshop_id).await?;
            info!("Cleanup job {} queued for {}", job.id, workshop_id);
            serde_json::to_value(job.wait().await?)?
        }
        Command::Retry { member_id } => {
            let job = orchestrator.retry(&member_id).await?;
            serde_json::to_value(job.wait().await?)?
        }
        Command::Status { workshop_id } => {
            serde_json::to_value(orchestrator.status_check(&workshop_id).await?)?
        }
        Command::List { workshop: None } => {
            serde_json::to_value(orchestrator.list_workshops().await?)?
        }
        Command::List {
            workshop: Some(workshop_id),
        } => serde_json::to_value(orchestrator.list_members(&workshop_id).await?)?,
        Command::Attempts { member_id } => {
            serde_json::to_value(orchestrator.attempts(&member_id).await?)?
        }
    };
    Ok(value)
}
