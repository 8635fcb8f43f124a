//! Backend registry.
//!
//! Resolves backend names to live, initialized instances. Instances are
//! built lazily, cached per kind, and shared by every caller. A backend that
//! fails to initialize is left out of the result so the others keep working;
//! initialization is attempted again after `reinit_interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pipeline_core::{Error, Result, RetryPolicy};
use telemetry::{health, metrics};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::append_log::AppendLogBackend;
use crate::backend::StorageBackend;
use crate::bulk_index::BulkIndexBackend;
use crate::config::{BackendConfig, BackendKind, StorageConfig};
use crate::relational::{RelationalBackend, SharedPgPool};

/// Resources shared by every backend a registry builds.
#[derive(Clone)]
pub struct SharedResources {
    pub pg_pool: Arc<SharedPgPool>,
    pub retry: RetryPolicy,
}

/// Builds a concrete backend from its configuration.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        config: BackendConfig,
        shared: &SharedResources,
    ) -> Result<Arc<dyn StorageBackend>>;
}

/// Factory for the three built-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(
        &self,
        config: BackendConfig,
        shared: &SharedResources,
    ) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match config {
            BackendConfig::AppendLog(c) => Arc::new(AppendLogBackend::new(c, shared.retry.clone())),
            BackendConfig::BulkIndex(c) => {
                Arc::new(BulkIndexBackend::new(c, shared.retry.clone())?)
            }
            BackendConfig::Relational(_) => Arc::new(RelationalBackend::new(
                shared.pg_pool.clone(),
                shared.retry.clone(),
            )?),
        };
        Ok(backend)
    }
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<BackendKind, Arc<dyn StorageBackend>>,
    failed_at: HashMap<BackendKind, Instant>,
}

/// Owns backend instances and the shared PostgreSQL pool.
pub struct BackendRegistry {
    config: StorageConfig,
    enabled: Vec<BackendKind>,
    factory: Arc<dyn BackendFactory>,
    shared: SharedResources,
    state: Mutex<RegistryState>,
    init_gates: HashMap<BackendKind, Mutex<()>>,
    closed: AtomicBool,
}

impl BackendRegistry {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultBackendFactory))
    }

    pub fn with_factory(config: StorageConfig, factory: Arc<dyn BackendFactory>) -> Self {
        let enabled = parse_enabled(&config.enabled_backends);
        let shared = SharedResources {
            pg_pool: Arc::new(SharedPgPool::new(config.postgresql.clone())),
            retry: config.retry_policy(),
        };
        Self {
            config,
            enabled,
            factory,
            shared,
            state: Mutex::new(RegistryState::default()),
            init_gates: BackendKind::ALL
                .into_iter()
                .map(|kind| (kind, Mutex::new(())))
                .collect(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Enabled backend kinds in configured order.
    pub fn enabled(&self) -> &[BackendKind] {
        &self.enabled
    }

    pub fn shared_pool(&self) -> &Arc<SharedPgPool> {
        &self.shared.pg_pool
    }

    /// Effective backend set for a request.
    ///
    /// Requested names are intersected with the enabled set; anything not
    /// enabled is dropped with a warning. An empty result falls back to the
    /// append log so records always land somewhere.
    pub fn resolve(&self, requested: Option<&[String]>) -> Vec<BackendKind> {
        let mut kinds = match requested {
            None => self.enabled.clone(),
            Some(names) => {
                let mut kinds = Vec::new();
                for name in names {
                    match BackendKind::parse(name) {
                        Some(kind) if self.enabled.contains(&kind) => {
                            if !kinds.contains(&kind) {
                                kinds.push(kind);
                            }
                        }
                        _ => warn!(backend = %name, "Requested backend is not enabled, skipping"),
                    }
                }
                kinds
            }
        };

        if kinds.is_empty() {
            warn!("No usable backends resolved, falling back to jsonl");
            kinds.push(BackendKind::AppendLog);
        }
        kinds
    }

    /// Live backends for `requested` (or every enabled backend).
    ///
    /// May return fewer backends than requested, including none. Cached
    /// backends are handed out without waiting on any initialization in
    /// progress; a caller only waits for kinds it asked for that are not
    /// live yet.
    pub async fn get_backends(
        &self,
        requested: Option<&[String]>,
    ) -> Vec<Arc<dyn StorageBackend>> {
        let kinds = self.resolve(requested);
        let mut slots: Vec<Option<Arc<dyn StorageBackend>>> = {
            let state = self.state.lock().await;
            kinds.iter().map(|kind| state.live.get(kind).cloned()).collect()
        };

        for (kind, slot) in kinds.iter().zip(slots.iter_mut()) {
            if slot.is_none() {
                *slot = self.get_or_init(*kind).await;
            }
        }

        let live = self.state.lock().await.live.len();
        metrics().active_backends.set(live as u64);
        slots.into_iter().flatten().collect()
    }

    /// Initializes `kind` unless it is live or cooling down after a failure.
    ///
    /// The per-kind gate serializes initialization, so one instance is built
    /// per kind. The shared state lock is never held across `initialize()`.
    async fn get_or_init(&self, kind: BackendKind) -> Option<Arc<dyn StorageBackend>> {
        let gate = self.init_gates.get(&kind)?;
        let _guard = gate.lock().await;

        {
            let state = self.state.lock().await;
            if let Some(backend) = state.live.get(&kind) {
                return Some(backend.clone());
            }
            if let Some(failed_at) = state.failed_at.get(&kind) {
                if failed_at.elapsed() < self.config.reinit_interval() {
                    debug!(backend = %kind, "Backend recently failed to initialize, skipping");
                    return None;
                }
            }
        }

        match self.build(kind).await {
            Ok(backend) => {
                let mut state = self.state.lock().await;
                if self.is_closed() {
                    // close_all ran while this backend was initializing.
                    drop(state);
                    if let Err(e) = backend.close().await {
                        warn!(backend = %kind, error = %e, "Error closing backend");
                    }
                    return None;
                }
                state.failed_at.remove(&kind);
                state.live.insert(kind, backend.clone());
                Some(backend)
            }
            Err(e) => {
                error!(
                    backend = %kind,
                    critical = true,
                    error = %e,
                    "Backend initialization failed, excluding it"
                );
                metrics().backend_init_failures.inc();
                if let Some(component) = health().component(kind.name()) {
                    component.set_unhealthy(e.to_string());
                }
                self.state
                    .lock()
                    .await
                    .failed_at
                    .insert(kind, Instant::now());
                None
            }
        }
    }

    async fn build(&self, kind: BackendKind) -> Result<Arc<dyn StorageBackend>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::init(kind.name(), "registry is closed"));
        }
        let backend = self
            .factory
            .create(self.config.backend_config(kind), &self.shared)?;
        backend.initialize().await?;

        if let Some(component) = health().component(kind.name()) {
            component.set_healthy();
        }
        info!(backend = %kind, "Backend ready");
        Ok(backend)
    }

    /// Closes every cached backend and the shared pool.
    ///
    /// Individual close errors are logged and returned, never propagated.
    /// Calls after the first are no-ops.
    pub async fn close_all(&self) -> Vec<(BackendKind, Error)> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Registry already closed");
            return Vec::new();
        }

        let mut state = self.state.lock().await;
        let mut errors = Vec::new();
        for (kind, backend) in state.live.drain() {
            match backend.close().await {
                Ok(()) => debug!(backend = %kind, "Backend closed"),
                Err(e) => {
                    warn!(backend = %kind, error = %e, "Error closing backend");
                    errors.push((kind, e));
                }
            }
            if let Some(component) = health().component(kind.name()) {
                component.set_closed();
            }
        }
        state.failed_at.clear();
        drop(state);

        self.shared.pg_pool.close().await;
        metrics().active_backends.set(0);
        info!(errors = errors.len(), "Storage backends closed");
        errors
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn parse_enabled(names: &[String]) -> Vec<BackendKind> {
    let mut kinds = Vec::new();
    for name in names {
        match BackendKind::parse(name) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => warn!(backend = %name, "Unknown backend in configuration, ignoring"),
        }
    }
    kinds
}
