//! Tests for backend selection and failure isolation.
//!
//! A backend that cannot initialize or write must never take the others
//! down with it, and must never fail the job.

use std::sync::Arc;

use integration_tests::fixtures;
use integration_tests::mocks::{MockBackend, MockFactory};
use integration_tests::setup::{jsonl_storage, read_jsonl_records, ContextOptions, TestContext};
use pipeline_core::JobStatus;
use storage::{BackendKind, BackendRegistry, StorageConfig};

fn two_backends(dir: &std::path::Path) -> StorageConfig {
    let mut storage = jsonl_storage(dir);
    storage.enabled_backends = vec!["jsonl".into(), "elasticsearch".into()];
    storage
}

fn context_with_mock(mock: Arc<MockBackend>, dir: &std::path::Path) -> TestContext {
    TestContext::with_options(ContextOptions {
        storage: Some(two_backends(dir)),
        factory: Some(Arc::new(MockFactory::new().with(mock))),
        ..Default::default()
    })
}

/// Unreachable search cluster: excluded at init, JSONL keeps working.
#[tokio::test]
async fn test_unreachable_search_backend_is_excluded() {
    let out = tempfile::tempdir().unwrap();
    let mut storage = two_backends(out.path());
    storage.elasticsearch.host = "127.0.0.1".into();
    storage.elasticsearch.port = 1;
    storage.elasticsearch.request_timeout_secs = 2;

    let ctx = TestContext::with_options(ContextOptions {
        storage: Some(storage),
        ..Default::default()
    });

    let backends = ctx.registry.get_backends(None).await;
    let kinds: Vec<BackendKind> = backends.iter().map(|b| b.kind()).collect();
    assert_eq!(kinds, vec![BackendKind::AppendLog]);

    let id = fixtures::document_id("isolated");
    let handle = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));

    let persisted = read_jsonl_records(out.path());
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].document_id, id);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_backend_write_failure_does_not_fail_job() {
    let out = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockBackend::new(BackendKind::BulkIndex));
    mock.set_fail_writes(true);
    let ctx = context_with_mock(mock.clone(), out.path());

    let id = fixtures::document_id("partial");
    let handle = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();

    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));
    assert!(mock.saved().is_empty());
    assert_eq!(read_jsonl_records(out.path()).len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_target_backends_limit_persistence() {
    let out = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockBackend::new(BackendKind::BulkIndex));
    let ctx = context_with_mock(mock.clone(), out.path());

    let id = fixtures::document_id("targeted");
    let handle = ctx
        .service
        .submit(&id, fixtures::article(&id), Some(vec!["Elasticsearch".into()]))
        .await
        .unwrap();
    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));

    assert_eq!(mock.saved().len(), 1);
    assert!(read_jsonl_records(out.path()).is_empty());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unenabled_target_falls_back_to_jsonl() {
    let ctx = TestContext::new();

    let id = fixtures::document_id("fallback");
    let handle = ctx
        .service
        .submit(&id, fixtures::article(&id), Some(vec!["postgresql".into()]))
        .await
        .unwrap();
    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));
    assert_eq!(ctx.jsonl_records().len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_init_is_retried_after_interval() {
    let out = tempfile::tempdir().unwrap();
    let mut storage = two_backends(out.path());
    storage.reinit_interval_secs = 0;

    let mock = Arc::new(MockBackend::new(BackendKind::BulkIndex));
    mock.set_fail_init(true);
    let registry =
        BackendRegistry::with_factory(storage, Arc::new(MockFactory::new().with(mock.clone())));

    assert_eq!(registry.get_backends(None).await.len(), 1);

    mock.set_fail_init(false);
    let kinds: Vec<BackendKind> = registry
        .get_backends(None)
        .await
        .iter()
        .map(|b| b.kind())
        .collect();
    assert_eq!(kinds, vec![BackendKind::AppendLog, BackendKind::BulkIndex]);

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_init_waits_for_cooldown() {
    let out = tempfile::tempdir().unwrap();
    let mut storage = two_backends(out.path());
    storage.reinit_interval_secs = 3600;

    let mock = Arc::new(MockBackend::new(BackendKind::BulkIndex));
    mock.set_fail_init(true);
    let registry =
        BackendRegistry::with_factory(storage, Arc::new(MockFactory::new().with(mock.clone())));

    assert_eq!(registry.get_backends(None).await.len(), 1);
    mock.set_fail_init(false);
    assert_eq!(registry.get_backends(None).await.len(), 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_backends_are_shared_and_closed_once() {
    let out = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockBackend::new(BackendKind::BulkIndex));
    let registry = BackendRegistry::with_factory(
        two_backends(out.path()),
        Arc::new(MockFactory::new().with(mock.clone())),
    );

    let first = registry.get_backends(None).await;
    let second = registry.get_backends(None).await;
    assert!(Arc::ptr_eq(&first[0], &second[0]));

    assert!(registry.close_all().await.is_empty());
    assert!(registry.close_all().await.is_empty());
    assert!(registry.is_closed());
    assert_eq!(mock.close_count(), 1);
}
