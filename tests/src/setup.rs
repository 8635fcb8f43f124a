//! Common test setup functions.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{
    BasicEnricher, Enricher, JobId, JobStatus, Record, RetryPolicy, RetrySettings,
};
use storage::{AppendLogConfig, BackendFactory, BackendRegistry, StorageConfig};
use tempfile::TempDir;
use worker::{
    InMemoryJobQueue, JobQueue, JobStatusStore, TaskExecutor, TaskService, WorkerScheduler,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Storage config writing daily JSONL files into `dir`, with no backend-local
/// retry delays.
pub fn jsonl_storage(dir: &Path) -> StorageConfig {
    StorageConfig {
        jsonl: AppendLogConfig::new(dir.join("processed_articles.jsonl")),
        retry: RetrySettings {
            max_attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

/// Options for a [`TestContext`].
pub struct ContextOptions {
    pub storage: Option<StorageConfig>,
    pub factory: Option<Arc<dyn BackendFactory>>,
    pub enricher: Arc<dyn Enricher>,
    pub policy: RetryPolicy,
    pub workers: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            storage: None,
            factory: None,
            enricher: Arc::new(BasicEnricher::new()),
            policy: RetryPolicy::immediate(3),
            workers: 2,
        }
    }
}

/// Fully wired pipeline over a temporary output directory.
///
/// Uses the production queue, executor, worker pool and registry; only the
/// enricher and individual backends are swapped for mocks when a test asks.
pub struct TestContext {
    pub dir: TempDir,
    pub registry: Arc<BackendRegistry>,
    pub queue: Arc<InMemoryJobQueue>,
    pub executor: Arc<TaskExecutor>,
    pub service: TaskService,
    scheduler: Option<WorkerScheduler>,
}

impl TestContext {
    /// Pipeline with the built-in enricher and the JSONL backend.
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_enricher(enricher: Arc<dyn Enricher>) -> Self {
        Self::with_options(ContextOptions {
            enricher,
            ..Default::default()
        })
    }

    pub fn with_options(options: ContextOptions) -> Self {
        telemetry::init_test_tracing();

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = options.storage.unwrap_or_else(|| jsonl_storage(dir.path()));
        let registry = Arc::new(match options.factory {
            Some(factory) => BackendRegistry::with_factory(storage, factory),
            None => BackendRegistry::new(storage),
        });

        let queue = Arc::new(InMemoryJobQueue::new());
        let statuses = JobStatusStore::new(Duration::from_secs(600));
        let executor = Arc::new(TaskExecutor::new(
            queue.clone(),
            statuses.clone(),
            registry.clone(),
            options.enricher,
            options.policy,
        ));
        let service = TaskService::new(queue.clone(), statuses);
        let scheduler = Some(WorkerScheduler::start(executor.clone(), options.workers));

        Self {
            dir,
            registry,
            queue,
            executor,
            service,
            scheduler,
        }
    }

    /// Waits for a job to finish, panicking if it takes too long.
    pub async fn wait(&self, id: &JobId) -> JobStatus {
        tokio::time::timeout(WAIT_TIMEOUT, self.service.wait(id, POLL_INTERVAL))
            .await
            .expect("Job did not reach a terminal state in time")
    }

    pub async fn wait_all(&self, ids: &[JobId]) -> Vec<JobStatus> {
        tokio::time::timeout(WAIT_TIMEOUT, self.service.wait_all(ids, POLL_INTERVAL))
            .await
            .expect("Jobs did not reach a terminal state in time")
    }

    /// Every record in the daily JSONL files, in file order.
    pub fn jsonl_records(&self) -> Vec<Record> {
        read_jsonl_records(self.dir.path())
    }

    /// Stops the workers and closes storage, as the binary does on shutdown.
    pub async fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        self.queue.close();
        let errors = self.registry.close_all().await;
        assert!(errors.is_empty(), "Close errors: {:?}", errors);
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads all `*.jsonl` files under `dir`.
pub fn read_jsonl_records(dir: &Path) -> Vec<Record> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .expect("Failed to read output dir")
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    paths.sort();

    paths
        .iter()
        .flat_map(|path| {
            fs::read_to_string(path)
                .expect("Failed to read JSONL file")
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str::<Record>(line).expect("Invalid JSONL line"))
                .collect::<Vec<_>>()
        })
        .collect()
}
