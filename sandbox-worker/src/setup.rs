use anyhow::{Context, Result};
use sandbox_driver::TerraformDriver;
use sandbox_orchestrator::db::{
    backup_database, create_pool, pending_migrations, prune_backups, run_migrations,
};
use sandbox_orchestrator::{LogNotifier, Orchestrator};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;

/// Backups kept next to the database; older ones are deleted.
pub const BACKUPS_KEPT: usize = 5;

async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    create_pool(db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

/// Opens the database, migrating it if needed. An existing database is
/// backed up only when a migration is about to touch it.
pub async fn open_database(db_path: &Path) -> Result<SqlitePool> {
    info!("Database path: {}", db_path.display());
    let existed = db_path.exists();

    let mut pool = open_pool(db_path).await?;
    let pending = pending_migrations(&pool).await?;
    if pending == 0 {
        return Ok(pool);
    }

    if existed {
        pool.close().await;
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
        for removed in prune_backups(db_path, BACKUPS_KEPT)? {
            info!("Removed old backup {}", removed.display());
        }
        pool = open_pool(db_path).await?;
    }

    run_migrations(&pool).await?;
    info!("Applied {} migration(s)", pending);
    Ok(pool)
}

/// Opens the database and wires the terraform driver into an orchestrator.
pub async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let pool = open_database(&config.db_path).await?;

    let tf = &config.terraform;
    let driver = TerraformDriver::new(&tf.binary, &tf.workspace_root, &tf.template_dir)
        .with_command_timeout(Duration::from_secs(tf.command_timeout_secs))
        .with_destroy_timeout(config.orchestrator.destruction_timeout());
    driver
        .check_installed()
        .context("Terraform is required to provision sandboxes")?;

    let orchestrator = Orchestrator::with_pool(
        pool,
        Arc::new(driver),
        Arc::new(LogNotifier),
        config.orchestrator.clone(),
    )?;
    Ok(orchestrator)
}
