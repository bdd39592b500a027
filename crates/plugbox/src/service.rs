//! Host-facing facade: `load`, `execute`, `unload` and `check_state`.
//!
//! The async entry points move the blocking pipeline onto tokio's blocking
//! pool, which plays the role of the worker pool. The `*_blocking` variants
//! are for callers that already run on a worker thread.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::{
    TRACE_TARGET,
    cache::ArchiveCache,
    checksum::combined_checksum,
    config::Config,
    error::{Error, Result},
    isolation::{IsolationLoader, IsolationPolicy},
    readiness::{Readiness, ReadinessGate},
    registry::{PluginRegistry, PluginState},
    source::{ArchiveDescriptor, ArchiveOriginReader, DirectoryOrigin},
    symbol::{ExecutionContext, SymbolResolver, SymbolTable},
};

/// Host symbols a task may reach, by exact name or namespace prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedSymbols {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Supplies per-task policy and execution contexts.
pub trait HostPolicyProvider: Send + Sync + 'static {
    fn allowed_symbols(&self, task_id: &str) -> AllowedSymbols;

    fn denied_symbols(&self, task_id: &str) -> Vec<String> {
        let _ = task_id;
        Vec::new()
    }

    fn create_execution_context(
        &self,
        task_id: &str,
        init: Option<&Bytes>,
    ) -> Option<ExecutionContext>;
}

impl<T: HostPolicyProvider + ?Sized> HostPolicyProvider for Arc<T> {
    fn allowed_symbols(&self, task_id: &str) -> AllowedSymbols {
        (**self).allowed_symbols(task_id)
    }

    fn denied_symbols(&self, task_id: &str) -> Vec<String> {
        (**self).denied_symbols(task_id)
    }

    fn create_execution_context(
        &self,
        task_id: &str,
        init: Option<&Bytes>,
    ) -> Option<ExecutionContext> {
        (**self).create_execution_context(task_id, init)
    }
}

/// Same policy for every task. The context init bytes, if any, become the
/// execution context.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    pub allowed: AllowedSymbols,
    pub denied: Vec<String>,
}

impl HostPolicyProvider for StaticPolicy {
    fn allowed_symbols(&self, _task_id: &str) -> AllowedSymbols {
        self.allowed.clone()
    }

    fn denied_symbols(&self, _task_id: &str) -> Vec<String> {
        self.denied.clone()
    }

    fn create_execution_context(
        &self,
        _task_id: &str,
        init: Option<&Bytes>,
    ) -> Option<ExecutionContext> {
        init.cloned().map(ExecutionContext::new)
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub task_id: String,
    pub entry_point: String,
    pub archives: Vec<ArchiveDescriptor>,
    pub context_init: Option<Bytes>,
}

impl LoadRequest {
    #[must_use]
    pub fn new(task_id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            entry_point: entry_point.into(),
            archives: Vec::new(),
            context_init: None,
        }
    }

    #[must_use]
    pub fn archive(mut self, descriptor: ArchiveDescriptor) -> Self {
        self.archives.push(descriptor);
        self
    }

    #[must_use]
    pub fn context_init(mut self, init: impl Into<Bytes>) -> Self {
        self.context_init = Some(init.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAck {
    /// `None` when any archive checksum is unknown.
    pub combined_checksum: Option<String>,
}

#[must_use]
pub struct PluginServiceBuilder {
    config: Config,
    origin: Option<Arc<dyn ArchiveOriginReader>>,
    core: Option<Arc<dyn SymbolResolver>>,
    host: Arc<dyn SymbolResolver>,
    catalog: SymbolTable,
    policy: Arc<dyn HostPolicyProvider>,
    gate: Arc<ReadinessGate>,
}

impl PluginServiceBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            origin: None,
            core: None,
            host: Arc::new(SymbolTable::new()),
            catalog: SymbolTable::new(),
            policy: Arc::new(StaticPolicy::default()),
            gate: Arc::new(ReadinessGate::new()),
        }
    }

    /// Where archives come from. Defaults to a [`DirectoryOrigin`] over the
    /// configured directories.
    pub fn origin(mut self, origin: Arc<dyn ArchiveOriginReader>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Replace the platform symbols every plugin can reach.
    pub fn core_symbols(mut self, core: Arc<dyn SymbolResolver>) -> Self {
        self.core = Some(core);
        self
    }

    /// The host's own symbol space, gated by each task's allow-list.
    pub fn host_symbols(mut self, host: Arc<dyn SymbolResolver>) -> Self {
        self.host = host;
        self
    }

    /// Implementations archive images bind their exports to.
    pub fn catalog(mut self, catalog: SymbolTable) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn policy_provider(mut self, policy: Arc<dyn HostPolicyProvider>) -> Self {
        self.policy = policy;
        self
    }

    /// Share an existing gate, e.g. one the dispatch thread already holds.
    pub fn readiness(mut self, gate: Arc<ReadinessGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn build(self) -> PluginService {
        let origin = self.origin.unwrap_or_else(|| {
            Arc::new(DirectoryOrigin::from_config(&self.config)) as Arc<dyn ArchiveOriginReader>
        });
        let mut loader = IsolationLoader::new(self.catalog);
        if let Some(core) = self.core {
            loader = loader.with_core(core);
        }
        PluginService {
            inner: Arc::new(Inner {
                cache: ArchiveCache::new(&self.config.cache_dir, origin),
                registry: PluginRegistry::new(loader, self.host),
                policy: self.policy,
                gate: self.gate,
                ready_timeout: self.config.ready_timeout,
            }),
        }
    }
}

struct Inner {
    cache: ArchiveCache,
    registry: PluginRegistry,
    policy: Arc<dyn HostPolicyProvider>,
    gate: Arc<ReadinessGate>,
    ready_timeout: Duration,
}

#[derive(Clone)]
pub struct PluginService {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for PluginService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginService")
            .field("cache", &self.inner.cache)
            .field("registry", &self.inner.registry)
            .field("gate", &self.inner.gate)
            .field("ready_timeout", &self.inner.ready_timeout)
            .finish_non_exhaustive()
    }
}

impl PluginService {
    pub fn builder(config: Config) -> PluginServiceBuilder {
        PluginServiceBuilder::new(config)
    }

    #[must_use]
    pub fn readiness(&self) -> &Arc<ReadinessGate> {
        &self.inner.gate
    }

    #[must_use]
    pub fn cache(&self) -> &ArchiveCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// # Errors
    /// See [`Self::load_blocking`]; a panicked worker surfaces as
    /// [`Error::Internal`].
    pub async fn load(&self, request: LoadRequest) -> Result<LoadAck> {
        let this = self.clone();
        run_blocking(move || this.load_blocking(&request)).await
    }

    /// Materialize every archive, wait for the execution host and register
    /// the plugin.
    ///
    /// # Errors
    /// - [`Error::AlreadyLoaded`] before any archive is touched.
    /// - Source and cache failures from materialization.
    /// - [`Error::NotReady`], [`Error::LoadTimeout`] or
    ///   [`Error::ServiceFailed`] from the readiness gate.
    /// - Isolation failures from the loader.
    pub fn load_blocking(&self, request: &LoadRequest) -> Result<LoadAck> {
        let inner = &*self.inner;
        let task_id = request.task_id.as_str();
        let span = info_span!(
            target: TRACE_TARGET,
            "service.load",
            task_id,
            entry_point = %request.entry_point,
            archives = request.archives.len()
        );
        let _enter = span.enter();

        if inner.registry.is_loaded(task_id) {
            return Err(Error::AlreadyLoaded {
                task_id: task_id.to_string(),
            });
        }

        let code = request
            .archives
            .iter()
            .map(|descriptor| inner.cache.materialize(descriptor))
            .collect::<Result<Vec<_>>>()?;
        let combined_checksum = combined_checksum(&code);

        match inner.gate.await_ready(inner.ready_timeout) {
            Readiness::Ready => {}
            Readiness::Pending => return Err(Error::NotReady),
            Readiness::TimedOut => {
                return Err(Error::LoadTimeout {
                    after: inner.ready_timeout,
                });
            }
            Readiness::Failed(cause) => return Err(Error::ServiceFailed { cause }),
        }

        let allowed = inner.policy.allowed_symbols(task_id);
        let policy = IsolationPolicy::builder()
            .allow_all(allowed.names)
            .allow_prefixes(allowed.prefixes)
            .deny_all(inner.policy.denied_symbols(task_id))
            .build();

        let init = request.context_init.as_ref();
        inner.registry.load(
            task_id,
            &request.entry_point,
            code,
            Arc::new(policy),
            |id| inner.policy.create_execution_context(id, init),
        )?;

        info!(
            target: TRACE_TARGET,
            combined_checksum = combined_checksum.as_deref().unwrap_or(""),
            "load complete"
        );
        Ok(LoadAck { combined_checksum })
    }

    /// # Errors
    /// See [`PluginRegistry::execute`].
    pub async fn execute(&self, task_id: impl Into<String>, input: Bytes) -> Result<Bytes> {
        let this = self.clone();
        let task_id = task_id.into();
        run_blocking(move || this.execute_blocking(&task_id, input)).await
    }

    /// # Errors
    /// See [`PluginRegistry::execute`].
    pub fn execute_blocking(&self, task_id: &str, input: Bytes) -> Result<Bytes> {
        self.inner.registry.execute(task_id, input)
    }

    /// # Errors
    /// [`Error::UnknownTask`] if nothing is loaded under the id.
    pub fn unload(&self, task_id: &str) -> Result<()> {
        self.inner.registry.unload(task_id)
    }

    #[must_use]
    pub fn check_state(&self, task_id: &str) -> PluginState {
        self.inner.registry.check_state(task_id)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(e.into()))?
}
