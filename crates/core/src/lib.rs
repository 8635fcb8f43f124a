//! Core types, validation and retry policy for the enrichment pipeline.

pub mod article;
pub mod enrichment;
pub mod error;
pub mod job;
pub mod record;
pub mod retry;

pub use article::{ArticleInput, CleaningOptions, MAX_DOCUMENT_ID_LEN};
pub use enrichment::{BasicEnricher, EnrichedFields, Enricher, TextCleaner};
pub use error::{Error, Result, StorageErrorCode};
pub use job::{Job, JobId, JobStatus};
pub use record::{Entity, Record, SCHEMA_VERSION};
pub use retry::{retry_transient, RetryPolicy, RetrySettings};
