use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "sandbox-worker")]
#[command(about = "Provision and tear down workshop sandboxes", long_about = None)]
#[command(version)]
pub struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true, env = "SANDBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the lifecycle sweep loop until interrupted
    Serve {
        /// Override the configured sweep interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run a single lifecycle sweep and wait for the cleanups it starts
    Sweep,

    /// Register a new workshop
    CreateWorkshop {
        #[arg(long)]
        name: String,

        /// Start time (RFC 3339)
        #[arg(long)]
        starts_at: DateTime<Utc>,

        /// End time (RFC 3339)
        #[arg(long)]
        ends_at: DateTime<Utc>,
    },

    /// Change a workshop's time window
    Reschedule {
        workshop_id: String,

        #[arg(long)]
        starts_at: DateTime<Utc>,

        #[arg(long)]
        ends_at: DateTime<Utc>,
    },

    /// Add an attendee to a workshop
    AddMember {
        workshop_id: String,

        #[arg(long)]
        name: String,
    },

    /// Provision every pending member of a workshop
    Deploy { workshop_id: String },

    /// Tear down every member of a workshop
    Cleanup { workshop_id: String },

    /// Provision a single failed member again
    Retry { member_id: String },

    /// Compare the stored status with the aggregated member statuses
    Status { workshop_id: String },

    /// List workshops, or the members of one workshop
    List {
        #[arg(long)]
        workshop: Option<String>,
    },

    /// Show the provisioning history of a member
    Attempts { member_id: String },
}
