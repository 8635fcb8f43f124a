//! Persistence for enriched records.
//!
//! Three backends implement [`StorageBackend`]: a daily append-only JSONL
//! log, a bulk search index and a relational table. [`BackendRegistry`]
//! resolves backend names to live, initialized instances and owns the
//! shared PostgreSQL pool.

pub mod append_log;
pub mod backend;
pub mod bulk_index;
pub mod config;
pub mod registry;
pub mod relational;

pub use append_log::{AppendLogBackend, Clock, SystemClock};
pub use backend::{BatchReport, StorageBackend};
pub use bulk_index::{BulkIndexBackend, BulkOutcome, HttpSearchClient, SearchTransport};
pub use config::{
    AppendLogConfig, BackendConfig, BackendKind, BulkIndexConfig, RelationalConfig, StorageConfig,
};
pub use registry::{BackendFactory, BackendRegistry, DefaultBackendFactory, SharedResources};
pub use relational::{RelationalBackend, SharedPgPool};
