use anyhow::Result;
use clap::Parser;
use sandbox_worker::{build_orchestrator, execute, start_sweeper_task, Args, Command, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = sandbox_logging::init_subscriber();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!(
        "Configuration loaded: db_path={}, pool_size={}",
        config.db_path.display(),
        config.orchestrator.worker_pool_size
    );

    let orchestrator = build_orchestrator(&config).await?;

    match args.command {
        Command::Serve { interval } => {
            let interval_secs = interval.unwrap_or(config.sweep_interval_secs).max(1);
            info!("Starting sandbox-worker service...");

            tokio::select! {
                _ = start_sweeper_task(orchestrator.clone(), interval_secs) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!(
                        "Shutdown requested, {} job(s) still in flight",
                        orchestrator.dispatcher().in_flight()
                    );
                }
            }
        }
        command => {
            let output = execute(&orchestrator, command).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
