//! Task executor: one enrichment attempt plus the retry state machine.
//!
//! An attempt validates the article, calls the enricher, builds the record
//! and hands it to every active backend. Storage failures are logged and
//! never fail the attempt. Enrichment failures are retried with exponential
//! backoff and jitter until attempts run out.

use std::sync::Arc;
use std::time::Instant;

use pipeline_core::{
    ArticleInput, CleaningOptions, Enricher, Error, Job, JobStatus, Record, RetryPolicy,
};
use storage::BackendRegistry;
use telemetry::metrics;
use tracing::{debug, error, info, warn};

use crate::queue::{Delivery, JobQueue};
use crate::status::JobStatusStore;

/// Result of a single execution attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Enrichment produced a record.
    Succeeded(Record),
    /// The attempt failed but another one may succeed.
    Retryable(Error),
    /// Retrying cannot help, e.g. an invalid payload.
    Fatal(Error),
}

/// Per-backend results of persisting one record.
#[derive(Debug, Default)]
pub struct PersistSummary {
    pub saved: Vec<&'static str>,
    pub failed: Vec<(&'static str, Error)>,
}

/// What the supervisor did with a finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed,
    Failed { attempts: u32 },
    Retrying { attempt: u32, delay_ms: u64 },
    Redelivered { attempt: u32 },
}

/// Runs jobs pulled from a queue.
pub struct TaskExecutor {
    queue: Arc<dyn JobQueue>,
    statuses: JobStatusStore,
    registry: Arc<BackendRegistry>,
    enricher: Arc<dyn Enricher>,
    policy: RetryPolicy,
}

impl TaskExecutor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        statuses: JobStatusStore,
        registry: Arc<BackendRegistry>,
        enricher: Arc<dyn Enricher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            statuses,
            registry,
            enricher,
            policy,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes one attempt for `job`.
    pub async fn attempt(&self, job: &Job) -> AttemptOutcome {
        let article = match ArticleInput::from_payload(&job.payload) {
            Ok(article) => article,
            Err(e) => return AttemptOutcome::Fatal(e),
        };
        if article.document_id != job.document_id {
            return AttemptOutcome::Fatal(Error::validation(format!(
                "payload document_id '{}' does not match job document_id '{}'",
                article.document_id, job.document_id
            )));
        }

        let options = cleaning_options(job);
        self.statuses.set(job.id, JobStatus::InProgress).await;

        let start = Instant::now();
        let fields = match self.enricher.enrich(&article, &options).await {
            Ok(fields) => fields,
            Err(e) => {
                metrics().enrichment_errors.inc();
                return match e {
                    Error::Validation(_) => AttemptOutcome::Fatal(e),
                    e => AttemptOutcome::Retryable(e),
                };
            }
        };
        metrics()
            .enrichment_latency_ms
            .observe(start.elapsed().as_millis() as u64);

        let record = match Record::from_enriched(&job.document_id, &article.text, fields) {
            Ok(record) => record,
            Err(e @ Error::Validation(_)) => return AttemptOutcome::Fatal(e),
            Err(e) => {
                metrics().enrichment_errors.inc();
                return AttemptOutcome::Retryable(e);
            }
        };

        let summary = self.persist(&record, job.target_backends.as_deref()).await;
        if !summary.failed.is_empty() || summary.saved.is_empty() {
            warn!(
                job_id = %job.id,
                document_id = %job.document_id,
                saved = ?summary.saved,
                failed = summary.failed.len(),
                "Record enriched but not persisted everywhere"
            );
        }

        AttemptOutcome::Succeeded(record)
    }

    /// Saves `record` on each active backend, isolating failures.
    pub async fn persist(&self, record: &Record, targets: Option<&[String]>) -> PersistSummary {
        let mut summary = PersistSummary::default();
        for backend in self.registry.get_backends(targets).await {
            match backend.save(record).await {
                Ok(()) => summary.saved.push(backend.name()),
                Err(e) => {
                    error!(
                        backend = backend.name(),
                        document_id = %record.document_id,
                        error = %e,
                        "Failed to persist record"
                    );
                    summary.failed.push((backend.name(), e));
                }
            }
        }
        summary
    }

    /// Runs one delivery to settlement.
    ///
    /// The attempt runs on its own task; a panic there is treated like a
    /// worker crash and the job is delivered again.
    pub async fn process(self: &Arc<Self>, delivery: Delivery) -> Settlement {
        let Delivery {
            delivery_id,
            mut job,
            redelivered,
        } = delivery;
        job.attempt_count += 1;

        if redelivered {
            info!(job_id = %job.id, attempt = job.attempt_count, "Processing redelivered job");
        }
        self.statuses.set(job.id, JobStatus::Started).await;
        debug!(
            job_id = %job.id,
            document_id = %job.document_id,
            attempt = job.attempt_count,
            "Starting attempt"
        );

        let this = self.clone();
        let attempt_job = job.clone();
        let outcome = tokio::spawn(async move { this.attempt(&attempt_job).await }).await;

        match outcome {
            Ok(outcome) => self.settle(delivery_id, job, outcome).await,
            Err(join_error) => {
                error!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    error = %join_error,
                    "Attempt crashed"
                );
                metrics().jobs_redelivered.inc();
                let reason = format!("attempt crashed: {}", join_error);
                if self.policy.should_retry(job.attempt_count) {
                    let attempt = job.attempt_count;
                    self.statuses.set(job.id, JobStatus::Pending).await;
                    self.finish(self.queue.redeliver(delivery_id, job).await);
                    Settlement::Redelivered { attempt }
                } else {
                    self.fail(delivery_id, &job, reason).await
                }
            }
        }
    }

    /// Decides retry versus terminal state for a finished attempt.
    async fn settle(&self, delivery_id: u64, job: Job, outcome: AttemptOutcome) -> Settlement {
        match outcome {
            AttemptOutcome::Succeeded(record) => {
                info!(
                    job_id = %job.id,
                    document_id = %job.document_id,
                    attempt = job.attempt_count,
                    entities = record.entities.len(),
                    "Job succeeded"
                );
                self.statuses
                    .set(
                        job.id,
                        JobStatus::Succeeded {
                            result: Box::new(record),
                        },
                    )
                    .await;
                metrics().jobs_succeeded.inc();
                self.finish(self.queue.ack(delivery_id).await);
                Settlement::Completed
            }
            AttemptOutcome::Fatal(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed permanently");
                self.fail(delivery_id, &job, e.to_string()).await
            }
            AttemptOutcome::Retryable(e) if self.policy.should_retry(job.attempt_count) => {
                let attempt = job.attempt_count;
                let delay = self.policy.delay_for(attempt);
                warn!(
                    job_id = %job.id,
                    document_id = %job.document_id,
                    attempt = attempt,
                    max_attempts = self.policy.max_attempts,
                    backoff_ms = %delay.as_millis(),
                    error = %e,
                    "Attempt failed, scheduling retry"
                );
                self.statuses.set(job.id, JobStatus::Pending).await;
                metrics().job_retries.inc();
                self.finish(self.queue.requeue_after(delivery_id, job, delay).await);
                Settlement::Retrying {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                }
            }
            AttemptOutcome::Retryable(e) => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempt_count,
                    error = %e,
                    "Job failed after exhausting retries"
                );
                self.fail(delivery_id, &job, e.to_string()).await
            }
        }
    }

    async fn fail(&self, delivery_id: u64, job: &Job, error: String) -> Settlement {
        self.statuses
            .set(
                job.id,
                JobStatus::Failed {
                    error,
                    attempts: job.attempt_count,
                },
            )
            .await;
        metrics().jobs_failed.inc();
        self.finish(self.queue.ack(delivery_id).await);
        Settlement::Failed {
            attempts: job.attempt_count,
        }
    }

    fn finish(&self, settled: pipeline_core::Result<()>) {
        if let Err(e) = settled {
            error!(error = %e, "Failed to settle delivery");
        }
    }
}

/// Custom cleaning options from the job, or defaults if absent or invalid.
fn cleaning_options(job: &Job) -> CleaningOptions {
    let Some(raw) = &job.cleaning_config else {
        return CleaningOptions::default();
    };
    match serde_json::from_value::<CleaningOptions>(raw.clone()) {
        Ok(options) => options,
        Err(e) => {
            warn!(
                job_id = %job.id,
                error = %e,
                "Ignoring unparsable cleaning config, using defaults"
            );
            CleaningOptions::default()
        }
    }
}
