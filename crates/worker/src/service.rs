//! Submission surface: enqueue jobs and poll their status.

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{Error, Job, JobId, JobStatus, Result};
use telemetry::metrics;
use tracing::{debug, info};

use crate::queue::JobQueue;
use crate::status::JobStatusStore;

/// Handle callers use to submit work and observe results.
#[derive(Clone)]
pub struct TaskService {
    queue: Arc<dyn JobQueue>,
    statuses: JobStatusStore,
}

impl TaskService {
    pub fn new(queue: Arc<dyn JobQueue>, statuses: JobStatusStore) -> Self {
        Self { queue, statuses }
    }

    /// Enqueues one job and returns immediately.
    pub async fn submit(
        &self,
        document_id: impl Into<String>,
        payload: serde_json::Value,
        target_backends: Option<Vec<String>>,
    ) -> Result<JobId> {
        self.submit_job(Job::new(document_id, payload, target_backends))
            .await
    }

    /// Enqueues a prepared job, e.g. one carrying custom cleaning options.
    pub async fn submit_job(&self, job: Job) -> Result<JobId> {
        if job.document_id.trim().is_empty() {
            return Err(Error::validation("document_id must not be empty"));
        }
        let id = job.id;
        let document_id = job.document_id.clone();

        self.statuses.set(id, JobStatus::Pending).await;
        self.queue.enqueue(job).await?;
        metrics().jobs_submitted.inc();
        debug!(job_id = %id, document_id = %document_id, "Job submitted");
        Ok(id)
    }

    /// Non-blocking status poll.
    pub async fn status(&self, id: &JobId) -> JobStatus {
        self.statuses.get(id).await
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait(&self, id: &JobId, poll_interval: Duration) -> JobStatus {
        loop {
            let status = self.status(id).await;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Waits for every job in `ids`, returning statuses in the same order.
    pub async fn wait_all(&self, ids: &[JobId], poll_interval: Duration) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(self.wait(id, poll_interval).await);
        }
        info!(jobs = ids.len(), "All jobs finished");
        statuses
    }
}
