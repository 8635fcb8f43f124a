//! Job status store.
//!
//! Statuses live in a TTL cache, so results of finished jobs expire after
//! the configured retention. An unknown or expired handle reads as pending.

use std::time::Duration;

use moka::future::Cache;
use pipeline_core::{JobId, JobStatus};

/// Upper bound on tracked jobs.
const STATUS_CACHE_MAX_CAPACITY: u64 = 1_000_000;

/// Status per job handle.
#[derive(Clone)]
pub struct JobStatusStore {
    cache: Cache<JobId, JobStatus>,
}

impl JobStatusStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(STATUS_CACHE_MAX_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn set(&self, id: JobId, status: JobStatus) {
        self.cache.insert(id, status).await;
    }

    /// Current status; `Pending` when the handle is unknown.
    pub async fn get(&self, id: &JobId) -> JobStatus {
        self.cache.get(id).await.unwrap_or(JobStatus::Pending)
    }

    /// Whether the store has any record of `id`.
    pub async fn contains(&self, id: &JobId) -> bool {
        self.cache.get(id).await.is_some()
    }
}
