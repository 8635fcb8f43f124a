//! Document Enrichment Pipeline
//!
//! Retryable enrichment of article documents with multi-backend persistence:
//! - Background workers running enrichment jobs with backoff and jitter
//! - Daily JSONL append log, search index bulk writes, PostgreSQL upserts
//! - Backend registry with failure isolation and a shared connection pool
//!
//! Usage: `enrichment-pipeline [articles.jsonl]`. With a file, one job is
//! submitted per line and the process exits once all of them finish.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pipeline_core::{BasicEnricher, JobId, JobStatus};
use storage::{BackendRegistry, StorageConfig};
use telemetry::{health, init_tracing_from_env, metrics};
use tokio::signal;
use tracing::{error, info, warn};
use worker::{
    InMemoryJobQueue, JobQueue, JobStatusStore, TaskExecutor, TaskService, WorkerConfig, WorkerScheduler,
};

/// Application configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct AppConfig {
    #[serde(default)]
    storage: StorageConfig,

    /// Task execution and retry settings
    #[serde(default)]
    tasks: WorkerConfig,
}

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting Enrichment Pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        backends = ?config.storage.enabled_backends,
        workers = config.tasks.worker_count,
        max_attempts = config.tasks.max_attempts,
        "Loaded configuration"
    );

    let registry = Arc::new(BackendRegistry::new(config.storage.clone()));

    // Initialize backends up front so failures show in the startup log.
    let ready = registry.get_backends(None).await;
    check_health(ready.len());

    let queue = Arc::new(InMemoryJobQueue::new());
    let statuses = JobStatusStore::new(config.tasks.result_ttl());
    let executor = Arc::new(TaskExecutor::new(
        queue.clone(),
        statuses.clone(),
        registry.clone(),
        Arc::new(BasicEnricher::new()),
        config.tasks.retry_policy(),
    ));
    let service = TaskService::new(queue.clone(), statuses);
    let scheduler = WorkerScheduler::start(executor, config.tasks.worker_count);

    match std::env::args().nth(1) {
        Some(path) => {
            let ids = submit_file(&service, Path::new(&path)).await?;
            tokio::select! {
                statuses = service.wait_all(&ids, STATUS_POLL_INTERVAL) => log_summary(&statuses),
                _ = shutdown_signal() => warn!("Interrupted before all jobs finished"),
            }
        }
        None => {
            info!("Waiting for jobs, press Ctrl+C to stop");
            shutdown_signal().await;
        }
    }

    // Cleanup
    info!("Shutting down...");
    scheduler.shutdown().await;
    queue.close();
    for (kind, e) in registry.close_all().await {
        error!(backend = %kind, error = %e, "Failed to close backend");
    }

    info!(metrics = ?metrics().snapshot(), "Shutdown complete");
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<AppConfig> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&AppConfig::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables, e.g. PIPELINE__TASKS__WORKER_COUNT
        .add_source(
            config::Environment::with_prefix("PIPELINE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("storage.enabled_backends")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Submits one job per JSONL line. Unparsable lines are skipped.
async fn submit_file(service: &TaskService, path: &Path) -> Result<Vec<JobId>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut ids = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let payload: serde_json::Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unparsable line");
                continue;
            }
        };
        let Some(document_id) = payload
            .get("document_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            warn!(line = line_no, "Skipping line without document_id");
            continue;
        };

        match service.submit(document_id, payload, None).await {
            Ok(id) => ids.push(id),
            Err(e) => warn!(line = line_no, error = %e, "Failed to submit job"),
        }
    }

    info!(path = %path.display(), jobs = ids.len(), "Submitted jobs from file");
    Ok(ids)
}

fn log_summary(statuses: &[JobStatus]) {
    let succeeded = statuses
        .iter()
        .filter(|s| matches!(s, JobStatus::Succeeded { .. }))
        .count();
    let failed = statuses.len() - succeeded;
    info!(
        total = statuses.len(),
        succeeded = succeeded,
        failed = failed,
        "All jobs finished"
    );
}

/// Log backend health after startup initialization.
fn check_health(ready: usize) {
    let report = health().report();
    for component in &report.components {
        if component.healthy {
            info!(backend = %component.name, "Backend: healthy");
        } else {
            error!(
                backend = %component.name,
                message = component.message.as_deref().unwrap_or("unknown"),
                "Backend: unhealthy"
            );
        }
    }
    info!(ready = ready, status = ?report.status, "Storage initialized");
    if !health().is_ready() {
        error!("No storage backend is available, records will not be persisted");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
