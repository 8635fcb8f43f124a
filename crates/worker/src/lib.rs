//! Task execution for the enrichment pipeline.
//!
//! - Queue with late acknowledgement (at-least-once delivery)
//! - Executor: enrichment attempt plus retry/backoff state machine
//! - Worker pool
//! - Submission and status surface

pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod status;

pub use executor::{AttemptOutcome, PersistSummary, Settlement, TaskExecutor};
pub use queue::{Delivery, InMemoryJobQueue, JobQueue};
pub use scheduler::{WorkerConfig, WorkerScheduler};
pub use service::TaskService;
pub use status::JobStatusStore;
