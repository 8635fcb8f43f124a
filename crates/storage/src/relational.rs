//! PostgreSQL backend.
//!
//! Every write is an `INSERT ... ON CONFLICT (document_id) DO UPDATE` over all
//! non-key columns inside one transaction. A batch commits once: either all
//! of its rows become visible or none do.
//!
//! ## Error mapping
//!
//! | sqlx error | SQLSTATE | classification |
//! |------------|----------|----------------|
//! | Database | class `08` (connection), `40001`, `40P01`, `53300`, `57P0x` | transient |
//! | Database | anything else (e.g. `22001` value too long) | permanent |
//! | Io, Tls, Protocol, PoolTimedOut, WorkerCrashed | n/a | transient |
//! | PoolClosed and the rest | n/a | permanent |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use pipeline_core::{retry_transient, Error, Record, Result, RetryPolicy};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, PgPool, Postgres, QueryBuilder};
use telemetry::metrics;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{BatchReport, StorageBackend};
use crate::config::{BackendKind, RelationalConfig};

const NAME: &str = "postgresql";

/// Rows per INSERT statement; keeps bind parameters well under the 65535 limit.
const ROWS_PER_STATEMENT: usize = 1000;

/// Insert column order. `document_id` must stay first.
const COLUMNS: [&str; 21] = [
    "document_id",
    "version",
    "original_text",
    "cleaned_text",
    "cleaned_title",
    "cleaned_excerpt",
    "cleaned_author",
    "cleaned_publication_date",
    "cleaned_revision_date",
    "cleaned_source_url",
    "cleaned_categories",
    "cleaned_tags",
    "cleaned_media_asset_urls",
    "cleaned_geographical_data",
    "cleaned_embargo_date",
    "cleaned_sentiment",
    "cleaned_word_count",
    "cleaned_publisher",
    "temporal_metadata",
    "entities",
    "cleaned_additional_metadata",
];

/// Process-wide connection pool, created on first use.
///
/// Owned by the backend registry and shared by every relational backend it
/// builds, which bounds total connections to `max_connections`.
pub struct SharedPgPool {
    config: RelationalConfig,
    pool: OnceCell<PgPool>,
}

impl SharedPgPool {
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RelationalConfig {
        &self.config
    }

    /// Connect options for the configured database.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .database(&self.config.dbname);
        match &self.config.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    /// Returns the pool, connecting it on first call.
    pub async fn get(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .min_connections(self.config.min_connections)
                    .max_connections(self.config.max_connections)
                    .acquire_timeout(self.config.acquire_timeout())
                    .connect_with(self.connect_options())
                    .await
                    .map_err(map_sqlx_error)?;
                info!(
                    host = %self.config.host,
                    dbname = %self.config.dbname,
                    min_connections = self.config.min_connections,
                    max_connections = self.config.max_connections,
                    "Created PostgreSQL pool"
                );
                Ok::<_, Error>(pool)
            })
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.pool.initialized()
    }

    /// Closes the pool if it was ever opened. Repeated calls are no-ops.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            if !pool.is_closed() {
                pool.close().await;
                info!("Closed PostgreSQL pool");
            }
        }
    }
}

/// Relational backend over the shared pool.
pub struct RelationalBackend {
    table: String,
    pool: Arc<SharedPgPool>,
    retry: RetryPolicy,
}

impl RelationalBackend {
    pub fn new(pool: Arc<SharedPgPool>, retry: RetryPolicy) -> Result<Self> {
        let table = pool.config().table_name.clone();
        validate_identifier(&table)?;
        Ok(Self { table, pool, retry })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &Arc<SharedPgPool> {
        &self.pool
    }

    /// Creates the target database if missing. Failures are only logged: the
    /// database usually exists and the role may lack CREATEDB.
    async fn ensure_database(&self) {
        let dbname = self.pool.config().dbname.clone();
        let options = self.pool.connect_options().database("postgres");
        let timeout = self.pool.config().acquire_timeout();

        let result: Result<bool> = async {
            let mut conn = connect_bootstrap(&options, timeout).await?;
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
                    .bind(&dbname)
                    .fetch_optional(&mut conn)
                    .await
                    .map_err(map_sqlx_error)?;
            if exists.is_none() {
                sqlx::query(&format!("CREATE DATABASE {}", quote_identifier(&dbname)))
                    .execute(&mut conn)
                    .await
                    .map_err(map_sqlx_error)?;
            }
            conn.close().await.map_err(map_sqlx_error)?;
            Ok(exists.is_none())
        }
        .await;

        match result {
            Ok(true) => info!(dbname = %dbname, "Created database"),
            Ok(false) => debug!(dbname = %dbname, "Database already exists"),
            Err(e) => warn!(
                dbname = %dbname,
                error = %e,
                "Could not verify or create database, assuming it exists"
            ),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        let pool = self.pool.get().await?;
        match sqlx::query(&create_table_sql(&self.table)).execute(pool).await {
            Ok(_) => Ok(()),
            // Concurrent CREATE TABLE IF NOT EXISTS can still collide in the catalog.
            Err(sqlx::Error::Database(db))
                if matches!(db.code().as_deref(), Some("42P07") | Some("23505")) =>
            {
                debug!(table = %self.table, "Table created concurrently");
                Ok(())
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    /// Upserts `records` in one transaction.
    ///
    /// Dropping the transaction on error rolls it back and returns the
    /// connection to the pool.
    async fn upsert(&self, records: &[&Record]) -> Result<()> {
        let pool = self.pool.get().await?;
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

        for slice in records.chunks(ROWS_PER_STATEMENT) {
            let mut builder = insert_builder(&self.table);
            builder.push_values(slice, |mut row, record| {
                row.push_bind(record.document_id.clone())
                    .push_bind(record.version.clone())
                    .push_bind(record.original_text.clone())
                    .push_bind(record.cleaned_text.clone())
                    .push_bind(record.cleaned_title.clone())
                    .push_bind(record.cleaned_excerpt.clone())
                    .push_bind(record.cleaned_author.clone())
                    .push_bind(record.cleaned_publication_date)
                    .push_bind(record.cleaned_revision_date)
                    .push_bind(record.cleaned_source_url.clone())
                    .push_bind(record.cleaned_categories.clone().map(Json))
                    .push_bind(record.cleaned_tags.clone().map(Json))
                    .push_bind(record.cleaned_media_asset_urls.clone().map(Json))
                    .push_bind(record.cleaned_geographical_data.clone().map(Json))
                    .push_bind(record.cleaned_embargo_date)
                    .push_bind(record.cleaned_sentiment.clone())
                    .push_bind(record.cleaned_word_count)
                    .push_bind(record.cleaned_publisher.clone())
                    .push_bind(temporal_date(record))
                    .push_bind(Json(record.entities.clone()))
                    .push_bind(record.cleaned_additional_metadata.clone().map(Json));
            });
            builder.push(upsert_clause());
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn upsert_with_retry(&self, records: &[&Record]) -> Result<()> {
        retry_transient(&self.retry, "postgresql.upsert", || async move {
            self.upsert(records).await
        })
        .await
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn initialize(&self) -> Result<()> {
        self.ensure_database().await;
        self.ensure_table()
            .await
            .map_err(|e| Error::init(NAME, e.to_string()))?;
        info!(table = %self.table, "Relational backend initialized");
        Ok(())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        let start = Instant::now();
        if let Err(e) = self.upsert_with_retry(&[record]).await {
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
            "Upserted record"
        );
        Ok(())
    }

    async fn save_batch(&self, records: &[Record]) -> Result<BatchReport> {
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let start = Instant::now();
        let rows = dedupe_last_wins(records);
        if rows.len() < records.len() {
            debug!(
                backend = NAME,
                duplicates = records.len() - rows.len(),
                "Collapsed duplicate document ids in batch"
            );
        }

        if let Err(e) = self.upsert_with_retry(&rows).await {
            metrics().storage_write_errors.inc();
            warn!(
                backend = NAME,
                count = records.len(),
                error = %e,
                "Batch rolled back"
            );
            return Err(e);
        }

        let elapsed = start.elapsed();
        metrics().batch_write_latency_ms.observe(elapsed.as_millis() as u64);
        metrics().records_persisted.inc_by(rows.len() as u64);
        info!(
            backend = NAME,
            count = rows.len(),
            latency_ms = %elapsed.as_millis(),
            "Upserted batch"
        );
        Ok(BatchReport::all_succeeded(records.len()))
    }

    async fn close(&self) -> Result<()> {
        // The pool belongs to the registry and is closed there.
        Ok(())
    }
}

/// Single connection bounded by `timeout`, so an unreachable server cannot
/// stall initialization indefinitely.
async fn connect_bootstrap(options: &PgConnectOptions, timeout: Duration) -> Result<PgConnection> {
    match tokio::time::timeout(timeout, PgConnection::connect_with(options)).await {
        Ok(conn) => conn.map_err(map_sqlx_error),
        Err(_) => Err(Error::transient(
            NAME,
            format!("connect timed out after {}s", timeout.as_secs()),
        )),
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            document_id VARCHAR(255) PRIMARY KEY,
            version VARCHAR(50),
            original_text TEXT,
            cleaned_text TEXT,
            cleaned_title TEXT,
            cleaned_excerpt TEXT,
            cleaned_author TEXT,
            cleaned_publication_date DATE,
            cleaned_revision_date DATE,
            cleaned_source_url TEXT,
            cleaned_categories JSONB,
            cleaned_tags JSONB,
            cleaned_media_asset_urls JSONB,
            cleaned_geographical_data JSONB,
            cleaned_embargo_date DATE,
            cleaned_sentiment TEXT,
            cleaned_word_count INTEGER,
            cleaned_publisher TEXT,
            temporal_metadata DATE,
            entities JSONB,
            cleaned_additional_metadata JSONB,
            created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
        )
        "#
    )
}

fn insert_builder(table: &str) -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, COLUMNS.join(", ")))
}

fn upsert_clause() -> String {
    let updates: Vec<String> = COLUMNS[1..]
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();
    format!(" ON CONFLICT (document_id) DO UPDATE SET {}", updates.join(", "))
}

/// Keeps only the last occurrence of each document id, in input order.
///
/// A single INSERT cannot touch the same conflict row twice.
fn dedupe_last_wins(records: &[Record]) -> Vec<&Record> {
    let last: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.document_id.as_str(), i))
        .collect();
    records
        .iter()
        .enumerate()
        .filter(|(i, r)| last.get(r.document_id.as_str()) == Some(i))
        .map(|(_, r)| r)
        .collect()
}

/// `temporal_metadata` as a DATE; unparsable values are stored as NULL.
fn temporal_date(record: &Record) -> Option<NaiveDate> {
    let raw = record.temporal_metadata.as_deref()?.trim();
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().or_else(|| {
        raw.get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
    });
    if parsed.is_none() {
        warn!(
            document_id = %record.document_id,
            temporal_metadata = raw,
            "Invalid temporal_metadata, storing NULL"
        );
    }
    parsed
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!("invalid table name '{}'", name)))
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Maps a sqlx error to a storage error, see the module table.
fn map_sqlx_error(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let msg = format!("database error {}: {}", code, db.message());
            let transient = code.starts_with("08")
                || code.starts_with("57P")
                || matches!(code.as_str(), "40001" | "40P01" | "53300");
            if transient {
                Error::transient(NAME, msg)
            } else {
                Error::permanent(NAME, msg)
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => Error::transient(NAME, err.to_string()),
        _ => Error::permanent(NAME, err.to_string()),
    }
}
