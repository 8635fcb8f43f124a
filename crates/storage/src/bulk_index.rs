//! Search-index backend.
//!
//! Single records are written with `PUT /{index}/_doc/{id}` (full document
//! replacement). Batches are split into fixed-size chunks, one `_bulk`
//! request per chunk; a failing chunk is counted and logged without
//! stopping the remaining chunks.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use pipeline_core::{retry_transient, Error, Record, Result, RetryPolicy};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use telemetry::metrics;
use tracing::{debug, error, info, warn};

use crate::backend::{BatchReport, StorageBackend};
use crate::config::{BackendKind, BulkIndexConfig};

const NAME: &str = "elasticsearch";

/// Per-item result counts of one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Reason of the first rejected item, if any
    pub first_error: Option<String>,
}

/// Minimal search-store API used by the backend.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Creates the index; an already-existing index is not an error.
    async fn create_index(&self, index: &str) -> Result<()>;

    /// Indexes one document under `_id = id`, replacing any previous version.
    async fn put_document(&self, index: &str, id: &str, document: &Value) -> Result<()>;

    /// Sends an NDJSON bulk body of `actions` operations.
    async fn bulk(&self, body: String, actions: usize) -> Result<BulkOutcome>;
}

/// `SearchTransport` over the Elasticsearch REST API.
pub struct HttpSearchClient {
    base_url: Url,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpSearchClient {
    pub fn new(config: &BulkIndexConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url())
            .map_err(|e| Error::config(format!("invalid search URL {}: {}", config.base_url(), e)))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::init(NAME, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            http,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("search URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("ApiKey {}", key)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        builder.send().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl SearchTransport for HttpSearchClient {
    async fn ping(&self) -> Result<()> {
        let response = self.send(self.request(Method::GET, self.base_url.clone())).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let url = self.endpoint(&[index])?;
        let response = self.send(self.request(Method::HEAD, url)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn create_index(&self, index: &str) -> Result<()> {
        let url = self.endpoint(&[index])?;
        let response = self
            .send(self.request(Method::PUT, url).json(&index_mappings()))
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!(index = index, "Index created concurrently");
            return Ok(());
        }
        Err(classify_status(status, &body))
    }

    async fn put_document(&self, index: &str, id: &str, document: &Value) -> Result<()> {
        let url = self.endpoint(&[index, "_doc", id])?;
        let response = self.send(self.request(Method::PUT, url).json(document)).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn bulk(&self, body: String, actions: usize) -> Result<BulkOutcome> {
        let url = self.endpoint(&["_bulk"])?;
        let response = self
            .send(
                self.request(Method::POST, url)
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::permanent(NAME, format!("invalid bulk response: {}", e)))?;
        Ok(parse_bulk_response(&parsed, actions))
    }
}

/// Field mappings applied when the index is created.
fn index_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "document_id": {"type": "keyword"},
                "version": {"type": "keyword"},
                "cleaned_text": {"type": "text"},
                "cleaned_title": {"type": "text"},
                "cleaned_publication_date": {"type": "date", "ignore_malformed": true},
                "temporal_metadata": {"type": "date", "ignore_malformed": true},
                "cleaned_categories": {"type": "keyword"},
                "cleaned_tags": {"type": "keyword"},
                "entities": {
                    "type": "nested",
                    "properties": {
                        "text": {"type": "keyword"},
                        "type": {"type": "keyword"},
                        "start_char": {"type": "integer"},
                        "end_char": {"type": "integer"}
                    }
                }
            }
        }
    })
}

/// Counts per-item results in a `_bulk` response body.
fn parse_bulk_response(body: &Value, actions: usize) -> BulkOutcome {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        // No item detail; trust the top-level flag.
        let errors = body.get("errors").and_then(Value::as_bool).unwrap_or(false);
        return if errors {
            BulkOutcome {
                succeeded: 0,
                failed: actions,
                first_error: Some("bulk request reported errors".to_string()),
            }
        } else {
            BulkOutcome {
                succeeded: actions,
                failed: 0,
                first_error: None,
            }
        };
    };

    let mut outcome = BulkOutcome::default();
    for item in items {
        let result = item.get("index").unwrap_or(item);
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(500);
        if (200..300).contains(&status) {
            outcome.succeeded += 1;
        } else {
            outcome.failed += 1;
            if outcome.first_error.is_none() {
                outcome.first_error = Some(
                    result
                        .get("error")
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("status {}", status)),
                );
            }
        }
    }
    outcome
}

/// Connect, timeout and request-send failures are transient.
fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(NAME, format!("request failed: {}", err))
    } else {
        Error::permanent(NAME, format!("request failed: {}", err))
    }
}

/// 429 and gateway errors are transient; any other failure status is permanent.
fn classify_status(status: StatusCode, body: &str) -> Error {
    let msg = format!("status {}: {}", status, body);
    match status.as_u16() {
        429 | 502 | 503 | 504 => Error::transient(NAME, msg),
        _ => Error::permanent(NAME, msg),
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

/// Bulk-index backend.
pub struct BulkIndexBackend {
    config: BulkIndexConfig,
    transport: Arc<dyn SearchTransport>,
    retry: RetryPolicy,
}

impl BulkIndexBackend {
    /// Backend talking to the configured search cluster over HTTP.
    pub fn new(config: BulkIndexConfig, retry: RetryPolicy) -> Result<Self> {
        let transport = Arc::new(HttpSearchClient::new(&config)?);
        Ok(Self::with_transport(config, transport, retry))
    }

    pub fn with_transport(
        config: BulkIndexConfig,
        transport: Arc<dyn SearchTransport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            transport,
            retry,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    /// NDJSON body with one `index` action per record.
    fn bulk_body(&self, records: &[Record]) -> Result<String> {
        let mut body = String::new();
        for record in records {
            let action = json!({
                "index": {"_index": self.config.index_name, "_id": record.document_id}
            });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&record.to_json_line()?);
            body.push('\n');
        }
        Ok(body)
    }

    async fn send_chunk(&self, chunk: &[Record]) -> Result<BulkOutcome> {
        let body = self.bulk_body(chunk)?;
        let body = body.as_str();
        let transport = self.transport.as_ref();
        retry_transient(&self.retry, "elasticsearch.bulk", || async move {
            transport.bulk(body.to_string(), chunk.len()).await
        })
        .await
    }
}

#[async_trait]
impl StorageBackend for BulkIndexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BulkIndex
    }

    async fn initialize(&self) -> Result<()> {
        let index = self.config.index_name.as_str();
        let to_init = |e: Error| Error::init(NAME, e.to_string());

        self.transport.ping().await.map_err(to_init)?;
        if !self.transport.index_exists(index).await.map_err(to_init)? {
            self.transport.create_index(index).await.map_err(to_init)?;
            info!(index = index, "Created search index");
        }

        info!(
            url = %self.config.base_url(),
            index = index,
            "Bulk-index backend initialized"
        );
        Ok(())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        let start = Instant::now();
        let document = serde_json::to_value(record)?;
        let index = self.config.index_name.as_str();
        let id = record.document_id.as_str();
        let document = &document;
        let transport = self.transport.as_ref();

        let result = retry_transient(&self.retry, "elasticsearch.put", || async move {
            transport.put_document(index, id, document).await
        })
        .await;

        if let Err(e) = result {
            metrics().storage_write_errors.inc();
            return Err(e);
        }

        let elapsed = start.elapsed();
        metrics().storage_latency_ms.observe(elapsed.as_millis() as u64);
        metrics().records_persisted.inc();
        debug!(
            backend = NAME,
            document_id = %record.document_id,
            latency_ms = %elapsed.as_millis(),
            "Indexed record"
        );
        Ok(())
    }

    async fn save_batch(&self, records: &[Record]) -> Result<BatchReport> {
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let start = Instant::now();
        let mut report = BatchReport::default();

        for (chunk_no, chunk) in records.chunks(self.chunk_size()).enumerate() {
            match self.send_chunk(chunk).await {
                Ok(outcome) => {
                    if let Some(reason) = &outcome.first_error {
                        warn!(
                            backend = NAME,
                            chunk = chunk_no,
                            failed = outcome.failed,
                            reason = %reason,
                            "Bulk chunk had rejected items"
                        );
                    }
                    report.merge(BatchReport {
                        succeeded: outcome.succeeded,
                        failed: outcome.failed,
                    });
                }
                Err(e) => {
                    error!(
                        backend = NAME,
                        chunk = chunk_no,
                        count = chunk.len(),
                        error = %e,
                        "Bulk chunk failed"
                    );
                    metrics().storage_write_errors.inc();
                    report.failed += chunk.len();
                }
            }
        }

        let elapsed = start.elapsed();
        metrics().batch_write_latency_ms.observe(elapsed.as_millis() as u64);
        metrics().records_persisted.inc_by(report.succeeded as u64);
        metrics().bulk_index_item_failures.inc_by(report.failed as u64);
        info!(
            backend = NAME,
            succeeded = report.succeeded,
            failed = report.failed,
            latency_ms = %elapsed.as_millis(),
            "Bulk indexing finished"
        );
        Ok(report)
    }

    async fn close(&self) -> Result<()> {
        // reqwest pools connections internally; nothing to release eagerly.
        Ok(())
    }
}
