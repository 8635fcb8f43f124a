//! Storage configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use pipeline_core::{Error, RetryPolicy, RetrySettings};
use serde::{Deserialize, Serialize};

/// The closed set of storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Daily JSONL files
    AppendLog,
    /// Search index with bulk writes
    BulkIndex,
    /// PostgreSQL table
    Relational,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::AppendLog, Self::BulkIndex, Self::Relational];

    /// Canonical name used in configuration, logs and health reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppendLog => "jsonl",
            Self::BulkIndex => "elasticsearch",
            Self::Relational => "postgresql",
        }
    }

    /// Parses a backend name, ignoring case and surrounding whitespace.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "jsonl" | "append_log" | "appendlog" => Some(Self::AppendLog),
            "elasticsearch" | "bulk_index" | "bulkindex" => Some(Self::BulkIndex),
            "postgresql" | "postgres" | "relational" => Some(Self::Relational),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| Error::config(format!("unknown storage backend '{}'", s)))
    }
}

/// Append-log backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendLogConfig {
    /// Nominal output file; daily files are written next to it.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("output/processed_articles.jsonl")
}

impl Default for AppendLogConfig {
    fn default() -> Self {
        Self {
            output_path: default_output_path(),
        }
    }
}

impl AppendLogConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    /// Directory holding the daily files.
    pub fn directory(&self) -> PathBuf {
        match self.output_path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Bulk-index backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkIndexConfig {
    #[serde(default = "default_es_host")]
    pub host: String,
    #[serde(default = "default_es_port")]
    pub port: u16,
    #[serde(default = "default_es_scheme")]
    pub scheme: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    /// Sent as `Authorization: ApiKey <key>` when set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Records per bulk request
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_es_host() -> String {
    "localhost".to_string()
}

fn default_es_port() -> u16 {
    9200
}

fn default_es_scheme() -> String {
    "http".to_string()
}

fn default_index_name() -> String {
    "processed_articles".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    500
}

impl Default for BulkIndexConfig {
    fn default() -> Self {
        Self {
            host: default_es_host(),
            port: default_es_port(),
            scheme: default_es_scheme(),
            index_name: default_index_name(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl BulkIndexConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Relational backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "enrichment".to_string()
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_table_name() -> String {
    "processed_articles".to_string()
}

fn default_min_connections() -> u32 {
    5
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            dbname: default_dbname(),
            user: default_pg_user(),
            password: None,
            table_name: default_table_name(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl RelationalConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Configuration of one backend, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    AppendLog(AppendLogConfig),
    BulkIndex(BulkIndexConfig),
    Relational(RelationalConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::AppendLog(_) => BackendKind::AppendLog,
            Self::BulkIndex(_) => BackendKind::BulkIndex,
            Self::Relational(_) => BackendKind::Relational,
        }
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Ordered backend names to enable
    #[serde(default = "default_enabled_backends")]
    pub enabled_backends: Vec<String>,
    #[serde(default)]
    pub jsonl: AppendLogConfig,
    #[serde(default)]
    pub elasticsearch: BulkIndexConfig,
    #[serde(default)]
    pub postgresql: RelationalConfig,
    /// Backend-local retry bounds for transient write errors
    #[serde(default = "default_storage_retry")]
    pub retry: RetrySettings,
    /// Minimum seconds between initialization attempts of a failed backend
    #[serde(default = "default_reinit_interval_secs")]
    pub reinit_interval_secs: u64,
}

fn default_enabled_backends() -> Vec<String> {
    vec![BackendKind::AppendLog.name().to_string()]
}

fn default_storage_retry() -> RetrySettings {
    RetrySettings::from(&RetryPolicy::backend())
}

fn default_reinit_interval_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled_backends: default_enabled_backends(),
            jsonl: AppendLogConfig::default(),
            elasticsearch: BulkIndexConfig::default(),
            postgresql: RelationalConfig::default(),
            retry: default_storage_retry(),
            reinit_interval_secs: default_reinit_interval_secs(),
        }
    }
}

impl StorageConfig {
    /// Config payload for a backend kind.
    pub fn backend_config(&self, kind: BackendKind) -> BackendConfig {
        match kind {
            BackendKind::AppendLog => BackendConfig::AppendLog(self.jsonl.clone()),
            BackendKind::BulkIndex => BackendConfig::BulkIndex(self.elasticsearch.clone()),
            BackendKind::Relational => BackendConfig::Relational(self.postgresql.clone()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    pub fn reinit_interval(&self) -> Duration {
        Duration::from_secs(self.reinit_interval_secs)
    }
}
