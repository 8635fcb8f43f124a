//! Worker pool pulling jobs from the queue.

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{RetryPolicy, RetrySettings};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::TaskExecutor;

/// Task execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Total attempts per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Concurrent workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// How long job results stay queryable
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_max_delay_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_jitter() -> f64 {
    1.0
}

fn default_worker_count() -> usize {
    4
}

fn default_result_ttl_secs() -> u64 {
    86_400 // 24 hours
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            worker_count: default_worker_count(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetrySettings {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
        .to_policy()
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// A fixed set of worker tasks sharing one executor.
pub struct WorkerScheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerScheduler {
    /// Spawns `worker_count` workers.
    pub fn start(executor: Arc<TaskExecutor>, worker_count: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker_count = worker_count.max(1);

        let handles = (0..worker_count)
            .map(|worker_id| {
                let executor = executor.clone();
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    run_worker(worker_id, executor, &mut stop).await;
                })
            })
            .collect();

        info!(workers = worker_count, "Workers started");
        Self { handles, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops taking new jobs and waits for in-progress attempts to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Workers stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    executor: Arc<TaskExecutor>,
    stop: &mut watch::Receiver<bool>,
) {
    debug!(worker_id = worker_id, "Worker running");
    loop {
        if *stop.borrow() {
            break;
        }
        let delivery = tokio::select! {
            _ = stop.changed() => break,
            delivery = executor.queue().dequeue() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        // Attempts are never cancelled midway.
        executor.process(delivery).await;
    }
    debug!(worker_id = worker_id, "Worker exiting");
}
