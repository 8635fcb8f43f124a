//! Mock implementations for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_core::{
    ArticleInput, BasicEnricher, CleaningOptions, EnrichedFields, Enricher, Error, Record, Result,
};
use storage::{
    BackendConfig, BackendFactory, BackendKind, BatchReport, DefaultBackendFactory,
    SharedResources, StorageBackend,
};

/// Enricher that fails a fixed number of times before delegating to the
/// built-in one.
pub struct MockEnricher {
    remaining_failures: AtomicU32,
    calls: AtomicU32,
    inner: BasicEnricher,
}

impl MockEnricher {
    pub fn failing(times: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(times),
            calls: AtomicU32::new(0),
            inner: BasicEnricher::new(),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn reliable() -> Self {
        Self::failing(0)
    }

    /// Number of enrich calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for MockEnricher {
    async fn enrich(
        &self,
        article: &ArticleInput,
        options: &CleaningOptions,
    ) -> Result<EnrichedFields> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::enrichment("mock enrichment failure"));
        }
        self.inner.enrich(article, options).await
    }
}

/// Backend that keeps records in memory.
pub struct MockBackend {
    kind: BackendKind,
    records: Mutex<Vec<Record>>,
    fail_init: AtomicBool,
    fail_writes: AtomicBool,
    closes: AtomicU32,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            records: Mutex::new(Vec::new()),
            fail_init: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            closes: AtomicU32::new(0),
        }
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn initialize(&self) -> Result<()> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::init(self.kind.name(), "mock init failure"));
        }
        Ok(())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::permanent(self.kind.name(), "mock write failure"));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn save_batch(&self, records: &[Record]) -> Result<BatchReport> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::permanent(self.kind.name(), "mock write failure"));
        }
        self.records.lock().extend_from_slice(records);
        Ok(BatchReport::all_succeeded(records.len()))
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory serving mock backends for some kinds and real ones for the rest.
#[derive(Default)]
pub struct MockFactory {
    mocks: HashMap<BackendKind, Arc<MockBackend>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `backend` for its kind instead of the real implementation.
    pub fn with(mut self, backend: Arc<MockBackend>) -> Self {
        self.mocks.insert(backend.kind, backend);
        self
    }
}

impl BackendFactory for MockFactory {
    fn create(
        &self,
        config: BackendConfig,
        shared: &SharedResources,
    ) -> Result<Arc<dyn StorageBackend>> {
        match self.mocks.get(&config.kind()) {
            Some(mock) => Ok(mock.clone()),
            None => DefaultBackendFactory.create(config, shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_enricher_fails_then_recovers() {
        let enricher = MockEnricher::failing(1);
        let article = ArticleInput::new("d1", "hello");
        let options = CleaningOptions::default();

        assert!(enricher.enrich(&article, &options).await.is_err());
        assert!(enricher.enrich(&article, &options).await.is_ok());
        assert_eq!(enricher.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_backend_write_failure() {
        let backend = MockBackend::new(BackendKind::BulkIndex);
        backend.set_fail_writes(true);
        let record = Record::minimal("d1", "a", "a");
        assert!(backend.save(&record).await.is_err());
        assert!(backend.saved().is_empty());
    }
}
