//! Append-only JSONL backend with one file per calendar day.
//!
//! The day is evaluated on every write, so a long-lived backend switches to
//! the next file at midnight without being rebuilt. Each successful write is
//! flushed and fsynced before returning.
//!
//! Lines are never rewritten. A redelivered job appends a second line for
//! the same `document_id`; readers take the last line per id.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use pipeline_core::{retry_transient, Error, Record, Result, RetryPolicy};
use telemetry::metrics;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BatchReport, StorageBackend};
use crate::config::{AppendLogConfig, BackendKind};

const NAME: &str = "jsonl";

/// Source of the current local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// File name for a given day, e.g. `processed_articles_2024-01-15.jsonl`.
pub fn daily_file_name(date: NaiveDate) -> String {
    format!("processed_articles_{}.jsonl", date.format("%Y-%m-%d"))
}

struct DailyFile {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

impl DailyFile {
    /// Appends `payload` and syncs it to disk.
    ///
    /// On failure the file is truncated back to its previous length so a
    /// retried write never leaves duplicate lines behind.
    async fn write_synced(&mut self, payload: &[u8]) -> Result<()> {
        let start_len = self
            .file
            .metadata()
            .await
            .map_err(|e| map_io_error("stat", &self.path, e))?
            .len();

        let written = async {
            self.file.write_all(payload).await?;
            self.file.flush().await?;
            self.file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            if let Err(truncate_err) = self.file.set_len(start_len).await {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "Failed to roll back partial append"
                );
            }
            return Err(map_io_error("write", &self.path, e));
        }
        Ok(())
    }
}

/// JSONL backend writing one record per line.
pub struct AppendLogBackend {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    current: Mutex<Option<DailyFile>>,
}

impl AppendLogBackend {
    pub fn new(config: AppendLogConfig, retry: RetryPolicy) -> Self {
        Self {
            directory: config.directory(),
            clock: Arc::new(SystemClock),
            retry,
            current: Mutex::new(None),
        }
    }

    /// Replaces the wall clock, e.g. to simulate midnight rollover.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the daily file for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory.join(daily_file_name(date))
    }

    async fn open_daily(&self, date: NaiveDate) -> Result<DailyFile> {
        let path = self.path_for(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| map_io_error("open", &path, e))?;
        debug!(path = %path.display(), "Opened daily file");
        Ok(DailyFile { date, path, file })
    }

    /// One write attempt against today's file.
    async fn try_append(&self, payload: &[u8]) -> Result<()> {
        let today = self.clock.now().date();
        let mut current = self.current.lock().await;

        let mut daily = match current.take() {
            Some(open) if open.date == today => open,
            previous => {
                if let Some(previous) = previous {
                    info!(
                        from = %previous.path.display(),
                        date = %today,
                        "Day changed, switching daily file"
                    );
                }
                self.open_daily(today).await?
            }
        };

        // A failed write drops the handle; the next attempt reopens.
        daily.write_synced(payload).await?;
        *current = Some(daily);
        Ok(())
    }

    async fn append(&self, payload: &[u8]) -> Result<()> {
        retry_transient(&self.retry, "jsonl.append", || async move {
            self.try_append(payload).await
        })
        .await
    }
}

#[async_trait]
impl StorageBackend for AppendLogBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AppendLog
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| {
                Error::init(
                    NAME,
                    format!("cannot create {}: {}", self.directory.display(), e),
                )
            })?;
        info!(directory = %self.directory.display(), "Append-log backend initialized");
        Ok(())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        let start = Instant::now();
        let mut line = record.to_json_line()?;
        line.push('\n');

        if let Err(e) = self.append(line.as_bytes()).await {
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
            "Saved record"
        );
        Ok(())
    }

    async fn save_batch(&self, records: &[Record]) -> Result<BatchReport> {
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let start = Instant::now();
        let mut payload = String::new();
        for record in records {
            payload.push_str(&record.to_json_line()?);
            payload.push('\n');
        }

        if let Err(e) = self.append(payload.as_bytes()).await {
            metrics().storage_write_errors.inc();
            return Err(e);
        }

        let elapsed = start.elapsed();
        metrics().batch_write_latency_ms.observe(elapsed.as_millis() as u64);
        metrics().records_persisted.inc_by(records.len() as u64);
        info!(
            backend = NAME,
            count = records.len(),
            latency_ms = %elapsed.as_millis(),
            "Appended batch"
        );
        Ok(BatchReport::all_succeeded(records.len()))
    }

    async fn close(&self) -> Result<()> {
        if let Some(daily) = self.current.lock().await.take() {
            debug!(path = %daily.path.display(), "Closed daily file");
        }
        Ok(())
    }
}

/// Classifies an I/O error: would-block, interrupted and timed-out are transient.
fn map_io_error(op: &str, path: &Path, err: std::io::Error) -> Error {
    let msg = format!("{} {} failed: {}", op, path.display(), err);
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
            Error::transient(NAME, msg)
        }
        _ => Error::permanent(NAME, msg),
    }
}
