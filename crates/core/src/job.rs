//! Task-layer job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::Record;

/// Opaque job handle returned on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued (initially or awaiting a retry).
    Pending,
    /// Claimed by a worker.
    Started,
    /// Enrichment call running.
    InProgress,
    /// Enrichment succeeded; persistence is best-effort and not reflected here.
    Succeeded { result: Box<Record> },
    /// Attempts exhausted or a non-retryable error occurred.
    Failed { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A unit of enrichment + persistence work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub document_id: String,
    /// Raw article payload, validated at execution time.
    pub payload: serde_json::Value,
    /// Optional cleaning overrides, ignored if unparsable.
    pub cleaning_config: Option<serde_json::Value>,
    /// Subset of enabled backends to persist to; `None` means all enabled.
    pub target_backends: Option<Vec<String>>,
    /// Attempts already made (0 before the first execution).
    pub attempt_count: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        document_id: impl Into<String>,
        payload: serde_json::Value,
        target_backends: Option<Vec<String>>,
    ) -> Self {
        Self {
            id: JobId::new(),
            document_id: document_id.into(),
            payload,
            cleaning_config: None,
            target_backends,
            attempt_count: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_cleaning_config(mut self, config: serde_json::Value) -> Self {
        self.cleaning_config = Some(config);
        self
    }
}
