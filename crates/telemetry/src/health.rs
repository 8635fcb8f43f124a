//! Backend health tracking.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Health status for the pipeline as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Health state of one storage backend.
///
/// Starts out not enabled; a backend only participates in the aggregate
/// report once the registry has tried to initialize it.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    enabled: AtomicBool,
    healthy: AtomicBool,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.enabled.store(true, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    /// Marks the backend as closed; it no longer counts towards the report.
    pub fn set_closed(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some("closed".to_string());
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }

    fn report(&self) -> ComponentHealthReport {
        ComponentHealthReport {
            name: self.name.to_string(),
            healthy: self.is_healthy(),
            message: self.message(),
        }
    }
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Health of every storage backend kind.
pub struct HealthRegistry {
    pub append_log: ComponentHealth,
    pub bulk_index: ComponentHealth,
    pub relational: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            append_log: ComponentHealth::new("jsonl"),
            bulk_index: ComponentHealth::new("elasticsearch"),
            relational: ComponentHealth::new("postgresql"),
        }
    }

    /// Looks up a component by backend name.
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        [&self.append_log, &self.bulk_index, &self.relational]
            .into_iter()
            .find(|c| c.name() == name)
    }

    /// Generate a health report over the backends that were initialized.
    pub fn report(&self) -> HealthReport {
        let components: Vec<ComponentHealthReport> =
            [&self.append_log, &self.bulk_index, &self.relational]
                .into_iter()
                .filter(|c| c.is_enabled())
                .map(ComponentHealth::report)
                .collect();

        let all_healthy = components.iter().all(|c| c.healthy);
        let any_healthy = components.iter().any(|c| c.healthy);

        let status = if components.is_empty() {
            HealthStatus::Unhealthy
        } else if all_healthy {
            HealthStatus::Healthy
        } else if any_healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, components }
    }

    /// At least one backend can accept writes.
    pub fn is_ready(&self) -> bool {
        self.report().status.is_serving()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global health registry.
pub static HEALTH: std::sync::LazyLock<HealthRegistry> =
    std::sync::LazyLock::new(HealthRegistry::new);

/// Get the global health registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}
