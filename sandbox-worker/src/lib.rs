//! Sandbox worker: configuration, the sweep loop and the operator CLI.

pub mod cli;
pub mod commands;
pub mod config;
pub mod setup;
pub mod sweeper;

pub use cli::{Args, Command};
pub use commands::execute;
pub use config::{Config, TerraformConfig};
pub use setup::{build_orchestrator, open_database, BACKUPS_KEPT};
pub use sweeper::{report_job, run_sweep_once, start_sweeper_task};
