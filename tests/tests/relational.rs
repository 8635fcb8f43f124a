//! PostgreSQL backend tests.
//!
//! Requires Docker (or `PIPELINE_TEST_POSTGRES_HOST`); run with
//! `cargo test -p integration-tests --test relational -- --ignored`.

use std::sync::Arc;

use chrono::NaiveDate;
use integration_tests::containers::TestPostgres;
use integration_tests::fixtures;
use integration_tests::setup::{jsonl_storage, ContextOptions, TestContext};
use pipeline_core::{JobStatus, Record, RetryPolicy};
use sqlx::PgPool;
use storage::{BackendKind, BackendRegistry, RelationalBackend, SharedPgPool, StorageBackend};

struct Fixture {
    _pg: TestPostgres,
    pool: Arc<SharedPgPool>,
    backend: RelationalBackend,
}

impl Fixture {
    async fn new() -> Self {
        let pg = TestPostgres::start().await;
        let pool = Arc::new(SharedPgPool::new(pg.relational_config()));
        let backend = RelationalBackend::new(pool.clone(), RetryPolicy::immediate(1))
            .expect("Failed to create backend");
        backend.initialize().await.expect("Failed to initialize");
        Self {
            _pg: pg,
            pool,
            backend,
        }
    }

    async fn db(&self) -> &PgPool {
        self.pool.get().await.expect("Pool unavailable")
    }

    async fn count(&self) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.backend.table()))
            .fetch_one(self.db().await)
            .await
            .expect("Count query failed")
    }

    async fn cleaned_text(&self, document_id: &str) -> String {
        sqlx::query_scalar(&format!(
            "SELECT cleaned_text FROM {} WHERE document_id = $1",
            self.backend.table()
        ))
        .bind(document_id)
        .fetch_one(self.db().await)
        .await
        .expect("Select failed")
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_is_idempotent() {
    let fx = Fixture::new().await;

    let record = Record::minimal("doc-1", "first", "first");
    fx.backend.save(&record).await.unwrap();
    fx.backend.save(&record).await.unwrap();
    assert_eq!(fx.count().await, 1);

    let updated = Record::minimal("doc-1", "second", "second");
    fx.backend.save(&updated).await.unwrap();
    assert_eq!(fx.count().await, 1);
    assert_eq!(fx.cleaned_text("doc-1").await, "second");

    fx.pool.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_initialize_is_repeatable() {
    let fx = Fixture::new().await;
    fx.backend.initialize().await.unwrap();
    fx.backend.save(&Record::minimal("doc-1", "a", "a")).await.unwrap();
    fx.backend.initialize().await.unwrap();
    assert_eq!(fx.count().await, 1);
    fx.pool.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_batch_is_all_or_nothing() {
    let fx = Fixture::new().await;

    let mut records = fixtures::records(5, "ok");
    records[2] = Record::minimal(fixtures::oversized_document_id(), "x", "x");

    let err = fx.backend.save_batch(&records).await.unwrap_err();
    assert!(!err.is_transient(), "Constraint violations are permanent");
    assert_eq!(fx.count().await, 0, "Failed batch must leave no rows");

    fx.pool.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_large_batch_with_duplicates() {
    let fx = Fixture::new().await;

    let mut records = fixtures::records(2500, "bulk");
    let first_id = records[0].document_id.clone();
    records.push(Record::minimal(first_id.clone(), "again", "again"));

    let report = fx.backend.save_batch(&records).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(fx.count().await, 2500);
    assert_eq!(fx.cleaned_text(&first_id).await, "again");

    fx.pool.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_invalid_temporal_metadata_stored_as_null() {
    let fx = Fixture::new().await;

    let mut record = Record::minimal("doc-t", "a", "a");
    record.temporal_metadata = Some("sometime last spring".into());
    fx.backend.save(&record).await.unwrap();

    record.document_id = "doc-u".into();
    record.temporal_metadata = Some("2024-05-01".into());
    fx.backend.save(&record).await.unwrap();

    let query = format!(
        "SELECT temporal_metadata FROM {} WHERE document_id = $1",
        fx.backend.table()
    );
    let invalid: Option<NaiveDate> = sqlx::query_scalar(&query)
        .bind("doc-t")
        .fetch_one(fx.db().await)
        .await
        .unwrap();
    let valid: Option<NaiveDate> = sqlx::query_scalar(&query)
        .bind("doc-u")
        .fetch_one(fx.db().await)
        .await
        .unwrap();

    assert_eq!(invalid, None);
    assert_eq!(valid, NaiveDate::from_ymd_opt(2024, 5, 1));

    fx.pool.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pipeline_persists_to_postgres_and_jsonl() {
    let pg = TestPostgres::start().await;
    let out = tempfile::tempdir().unwrap();
    let mut storage = jsonl_storage(out.path());
    storage.enabled_backends = vec!["jsonl".into(), "postgresql".into()];
    storage.postgresql = pg.relational_config();
    let table = storage.postgresql.table_name.clone();

    let ctx = TestContext::with_options(ContextOptions {
        storage: Some(storage),
        ..Default::default()
    });

    let id = fixtures::document_id("pg");
    let handle = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));

    let pool = ctx.registry.shared_pool().get().await.unwrap();
    let rows: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE document_id = $1",
        table
    ))
    .bind(&id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(rows, 1);

    ctx.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_registry_shares_one_pool() {
    let pg = TestPostgres::start().await;
    let out = tempfile::tempdir().unwrap();
    let mut storage = jsonl_storage(out.path());
    storage.enabled_backends = vec!["postgresql".into()];
    storage.postgresql = pg.relational_config();

    let registry = BackendRegistry::new(storage);
    let backends = registry.get_backends(None).await;
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].kind(), BackendKind::Relational);
    assert!(registry.shared_pool().is_connected());

    assert!(registry.close_all().await.is_empty());
    assert!(registry.close_all().await.is_empty());
}
