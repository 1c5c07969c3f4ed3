use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use netops_core::NetopsConfig;
use netops_scheduler::{SchedulerController, SchedulerError, SqliteJobStore, TaskRegistry};

mod cli;
mod tasks;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netops_daemon=info,netops_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > NETOPS_CONFIG env > ~/.netops/netops.toml
    let config_path = cli
        .config
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("NETOPS_CONFIG").ok());
    let config = NetopsConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        NetopsConfig::default()
    });

    let db_path = config.database.resolved_path();
    let store = SqliteJobStore::open(&db_path)
        .with_context(|| format!("opening scheduler database {}", db_path.display()))?
        .with_write_attempts(config.scheduler.store_write_attempts);

    let registry = Arc::new(TaskRegistry::new());
    tasks::register_builtin_tasks(&registry);

    let controller = Arc::new(SchedulerController::with_defaults(
        Arc::new(store),
        registry,
        config.scheduler.clone(),
    ));

    let command = cli.command.unwrap_or(Commands::Run);
    if let Err(e) = dispatch(&controller, command).await {
        // Scheduler errors carry a stable code for scripts driving the CLI.
        if let Some(err) = e.downcast_ref::<SchedulerError>() {
            let body = serde_json::json!({ "error": err.code(), "message": err.to_string() });
            eprintln!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(1);
        }
        return Err(e);
    }
    Ok(())
}

async fn dispatch(controller: &Arc<SchedulerController>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run => run(controller).await?,
        Commands::List => print_json(&controller.list_jobs()?)?,
        Commands::Show { id } => print_json(&controller.get_job(&id)?)?,
        Commands::Status { id } => print_json(&controller.get_job_status(&id)?)?,
        Commands::Next { id } => {
            let job = controller.get_job(&id)?;
            let next = controller.get_next_run_time(&job)?;
            print_json(&serde_json::json!({ "job_id": job.id, "next_run": next }))?;
        }
        Commands::History { job, limit, offset } => {
            print_json(&controller.history(job.as_deref(), limit, offset)?)?
        }
        Commands::RunNow { id } => {
            let run = controller.run_job_now(&id).await?;
            print_json(&run)?;
            if !run.succeeded() {
                std::process::exit(2);
            }
        }
        Commands::Remove { id } => {
            controller.unregister_job(&id)?;
            print_json(&serde_json::json!({ "removed": id }))?;
        }
        Commands::Export { path } => {
            let path = resolve_jobs_path(controller, path)?;
            let count = controller.export_to(&path)?;
            print_json(&serde_json::json!({ "path": path, "exported": count }))?;
        }
        Commands::Import { path } => {
            let path = resolve_jobs_path(controller, path)?;
            print_json(&controller.import_from(&path)?)?;
        }
    }
    Ok(())
}

/// Foreground mode: import the jobs file, tick until Ctrl-C, stop gracefully.
async fn run(controller: &Arc<SchedulerController>) -> anyhow::Result<()> {
    let settings = controller.settings();
    if settings.load_jobs_on_start {
        if let Some(path) = settings.jobs_file_path().filter(|p| p.exists()) {
            let report = controller.load_config()?;
            info!(
                path = %path.display(),
                imported = report.imported,
                rejected = report.rejected.len(),
                "job file loaded"
            );
        }
    }

    controller.start()?;
    info!("netopsd running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    controller.stop().await?;
    Ok(())
}

fn resolve_jobs_path(
    controller: &SchedulerController,
    explicit: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(|| controller.settings().jobs_file_path())
        .context("no path given and scheduler.jobs_file is not configured")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
