//! End-to-end tests for the task pipeline.
//!
//! Jobs go through the real queue, worker pool, executor and JSONL backend:
//! submit → worker attempt → enrich → persist → status.

use std::sync::Arc;

use integration_tests::mocks::MockEnricher;
use integration_tests::setup::{ContextOptions, TestContext};
use integration_tests::fixtures;
use pipeline_core::{JobStatus, RetryPolicy};
use serde_json::json;

#[tokio::test]
async fn test_submit_persists_enriched_record() {
    let ctx = TestContext::new();
    let id = fixtures::document_id("e2e");

    let job = ctx
        .service
        .submit(&id, fixtures::article_with_metadata(&id), None)
        .await
        .expect("Submit failed");

    let record = match ctx.wait(&job).await {
        JobStatus::Succeeded { result } => result,
        other => panic!("Expected success, got {:?}", other),
    };
    assert_eq!(record.document_id, id);
    assert_eq!(record.version, "1.0");
    assert_eq!(record.cleaned_title.as_deref(), Some("Weekend forecast"));
    assert_eq!(
        record.cleaned_categories,
        Some(vec!["weather".to_string(), "local".to_string()])
    );
    assert_eq!(record.temporal_metadata.as_deref(), Some("2024-03-15"));
    assert!(!record.cleaned_text.contains('<'));

    let persisted = ctx.jsonl_records();
    assert_eq!(persisted.len(), 1, "Expected one JSONL line");
    assert_eq!(persisted[0], *record);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_many_jobs_all_complete() {
    let ctx = TestContext::new();
    let ids: Vec<String> = (0..25).map(|i| format!("bulk-{:02}", i)).collect();

    let mut handles = Vec::new();
    for id in &ids {
        handles.push(ctx.service.submit(id, fixtures::article(id), None).await.unwrap());
    }

    let statuses = ctx.wait_all(&handles).await;
    assert!(
        statuses.iter().all(|s| matches!(s, JobStatus::Succeeded { .. })),
        "All jobs should succeed: {:?}",
        statuses
    );

    let mut persisted: Vec<String> = ctx
        .jsonl_records()
        .into_iter()
        .map(|r| r.document_id)
        .collect();
    persisted.sort();
    assert_eq!(persisted, ids);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_custom_cleaning_config_is_applied() {
    let ctx = TestContext::new();
    let id = fixtures::document_id("clean");
    let job = pipeline_core::Job::new(&id, fixtures::article(&id), None)
        .with_cleaning_config(json!({"lowercase": true}));

    let handle = ctx.service.submit_job(job).await.unwrap();
    match ctx.wait(&handle).await {
        JobStatus::Succeeded { result } => {
            assert_eq!(result.cleaned_text, result.cleaned_text.to_lowercase());
            assert!(result.cleaned_text.contains("council"));
        }
        other => panic!("Expected success, got {:?}", other),
    }

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_retry_then_success() {
    let enricher = Arc::new(MockEnricher::failing(2));
    let ctx = TestContext::with_enricher(enricher.clone());
    let id = fixtures::document_id("flaky");

    let handle = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    assert!(matches!(ctx.wait(&handle).await, JobStatus::Succeeded { .. }));
    assert_eq!(enricher.calls(), 3);
    assert_eq!(ctx.jsonl_records().len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhaustion_reports_failure() {
    let enricher = Arc::new(MockEnricher::always_failing());
    let ctx = TestContext::with_options(ContextOptions {
        enricher: enricher.clone(),
        policy: RetryPolicy::immediate(3),
        ..Default::default()
    });
    let id = fixtures::document_id("doomed");

    let handle = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    match ctx.wait(&handle).await {
        JobStatus::Failed { error, attempts } => {
            assert_eq!(attempts, 3);
            assert!(error.contains("mock enrichment failure"), "error: {}", error);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert_eq!(enricher.calls(), 3);
    assert!(ctx.jsonl_records().is_empty(), "Failed jobs persist nothing");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_invalid_payload_fails_without_retry() {
    let enricher = Arc::new(MockEnricher::reliable());
    let ctx = TestContext::with_enricher(enricher.clone());
    let id = fixtures::document_id("invalid");

    let handle = ctx
        .service
        .submit(&id, fixtures::invalid_article(&id), None)
        .await
        .unwrap();
    match ctx.wait(&handle).await {
        JobStatus::Failed { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("Expected failure, got {:?}", other),
    }
    assert_eq!(enricher.calls(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unknown_handle_reads_pending() {
    let ctx = TestContext::new();
    let unknown = pipeline_core::JobId::new();
    assert_eq!(ctx.service.status(&unknown).await, JobStatus::Pending);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_resubmitting_same_document_appends_again() {
    let ctx = TestContext::new();
    let id = fixtures::document_id("dup");

    let first = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    ctx.wait(&first).await;
    let second = ctx.service.submit(&id, fixtures::article(&id), None).await.unwrap();
    ctx.wait(&second).await;

    // The log is append-only; readers take the last line per document.
    let persisted = ctx.jsonl_records();
    assert_eq!(persisted.len(), 2);
    assert!(persisted.iter().all(|r| r.document_id == id));

    ctx.shutdown().await;
}
