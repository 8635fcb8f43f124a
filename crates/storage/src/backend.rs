//! The contract every storage backend implements.

use async_trait::async_trait;
use pipeline_core::{Record, Result};

use crate::config::BackendKind;

/// Outcome of a `save_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn all_succeeded(count: usize) -> Self {
        Self {
            succeeded: count,
            failed: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// A persistence target for enriched records.
///
/// All writes are upserts keyed by `document_id`, so redelivered jobs never
/// produce duplicates. Implementations must be safe to share across tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend kind; also determines the name used in logs and health.
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Idempotent setup: create directory, index or table if absent.
    async fn initialize(&self) -> Result<()>;

    /// Persist one record durably before returning.
    async fn save(&self, record: &Record) -> Result<()>;

    /// Persist many records. An empty slice is a no-op.
    async fn save_batch(&self, records: &[Record]) -> Result<BatchReport>;

    /// Release held resources. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
