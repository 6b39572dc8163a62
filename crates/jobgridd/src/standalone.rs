//! Standalone mode: all process kinds in one OS process.

use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use jobgrid_core::JobgridConfig;
use jobgrid_registry::{LivenessReaper, ProcessRegistry};
use jobgrid_state::{ProcessKind, StateStore};
use jobgrid_workers::{JobStatusMaintainer, TaskStatusMaintainer};

pub async fn run(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    workers: usize,
) -> anyhow::Result<()> {
    info!("jobgrid daemon starting in standalone mode");

    let config = match &config_path {
        Some(path) => JobgridConfig::from_file(path)?,
        None => JobgridConfig::default(),
    };
    let keepalive_period = config.keepalive_period()?;
    let keepalive_timeout = config.keepalive_timeout()?;
    let reaper_period = config.reaper_period()?;
    let listener_period = config.listener_period()?;
    let retry_backoff = config.retry_initial_backoff()?;

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let db_path = config.store_path(&data_dir);
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Register hosted processes ──────────────────────────────

    let registry = ProcessRegistry::new(state.clone())
        .with_resource(config.resource())
        .with_keepalive_period(keepalive_period)
        .with_retry_initial_backoff(retry_backoff);

    let controller = registry.register(ProcessKind::Controller)?;
    let mut hosted = vec![controller.clone(), registry.register(ProcessKind::Scheduler)?];
    for _ in 0..workers {
        hosted.push(registry.register(ProcessKind::Worker)?);
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background loops ─────────────────────────────────

    let mut handles = Vec::new();
    for process in &hosted {
        handles.push(registry.spawn_keepalive(&process.id, shutdown_rx.clone()));
    }

    let reaper = LivenessReaper::new(state.clone())
        .with_timeout(keepalive_timeout)
        .with_period(reaper_period)
        .with_retry_initial_backoff(retry_backoff);
    handles.push(tokio::spawn(reaper.run(shutdown_rx.clone())));

    let jobs = JobStatusMaintainer::new(state.clone(), controller.id.clone())
        .with_period(listener_period)
        .with_retry_initial_backoff(retry_backoff);
    handles.push(tokio::spawn(jobs.run(shutdown_rx.clone())));

    let tasks = TaskStatusMaintainer::new(state.clone(), controller.id.clone())
        .with_period(listener_period)
        .with_retry_initial_backoff(retry_backoff);
    handles.push(tokio::spawn(tasks.run(shutdown_rx)));

    info!(
        controller = %controller.id,
        workers,
        keepalive_ms = keepalive_period.as_millis() as u64,
        "jobgrid daemon running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }

    for process in &hosted {
        if let Err(e) = registry.deregister(&process.id).await {
            warn!(id = %process.id, error = %e, "deregistration failed");
        }
    }

    info!("jobgrid daemon stopped");
    Ok(())
}
