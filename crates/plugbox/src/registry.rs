use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::{
    TRACE_TARGET,
    code::CodeHandle,
    error::{Error, Result},
    isolation::{IsolationLoader, IsolationPolicy, LoadedPlugin, PrivateLoader},
    symbol::{ExecutionContext, Plugin, SymbolResolver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    NotLoaded,
    Loaded,
}

struct PluginRecord {
    plugin: Box<dyn Plugin>,
    loader: Arc<PrivateLoader>,
    context: Option<ExecutionContext>,
}

/// Task id -> loaded plugin.
///
/// Each record has its own lock, so different tasks execute concurrently.
/// Ordering of operations on one task id is up to the caller.
pub struct PluginRegistry {
    loader: IsolationLoader,
    host: Arc<dyn SymbolResolver>,
    records: DashMap<String, Arc<Mutex<PluginRecord>>>,
}

impl core::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loader", &self.loader)
            .field("loaded", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    pub fn new(loader: IsolationLoader, host: Arc<dyn SymbolResolver>) -> Self {
        Self {
            loader,
            host,
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_loaded(&self, task_id: &str) -> bool {
        self.records.contains_key(task_id)
    }

    /// Load `entry_point` from `code` and register it under `task_id`.
    ///
    /// # Errors
    /// [`Error::AlreadyLoaded`] if the id is taken, otherwise whatever the
    /// isolation loader reports. The registry is unchanged on failure.
    pub fn load(
        &self,
        task_id: &str,
        entry_point: &str,
        code: Vec<CodeHandle>,
        policy: Arc<IsolationPolicy>,
        context_factory: impl FnOnce(&str) -> Option<ExecutionContext>,
    ) -> Result<()> {
        let span = info_span!(target: TRACE_TARGET, "registry.load", task_id, entry_point);
        let _enter = span.enter();

        if self.is_loaded(task_id) {
            return Err(already_loaded(task_id));
        }

        let LoadedPlugin { plugin, loader } =
            self.loader
                .load(entry_point, code, Arc::clone(&self.host), policy)?;
        let context = context_factory(task_id);

        match self.records.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(already_loaded(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(PluginRecord {
                    plugin,
                    loader,
                    context,
                })));
                info!(target: TRACE_TARGET, "plugin loaded");
                Ok(())
            }
        }
    }

    /// Run the plugin for `task_id` with its stored context.
    ///
    /// # Errors
    /// [`Error::UnknownTask`] if nothing is loaded under the id, and
    /// [`Error::PluginFailed`] if the plugin reports a failure.
    pub fn execute(&self, task_id: &str, input: Bytes) -> Result<Bytes> {
        let record = self
            .records
            .get(task_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| unknown_task(task_id))?;

        let mut record = record.lock();
        let PluginRecord {
            plugin, context, ..
        } = &mut *record;
        plugin
            .execute(input, context.as_ref())
            .map_err(|source| Error::PluginFailed {
                task_id: task_id.to_string(),
                source,
            })
    }

    /// Remove the plugin for `task_id`, giving it a chance to shut down.
    ///
    /// Waits for an in-flight `execute` on the same task to finish.
    ///
    /// # Errors
    /// [`Error::UnknownTask`] if nothing is loaded under the id.
    pub fn unload(&self, task_id: &str) -> Result<()> {
        let (_, record) = self
            .records
            .remove(task_id)
            .ok_or_else(|| unknown_task(task_id))?;

        let mut record = record.lock();
        let PluginRecord {
            plugin,
            loader,
            context,
        } = &mut *record;
        plugin.detach(context.as_ref());
        info!(target: TRACE_TARGET, task_id, archives = ?loader.archives(), "plugin unloaded");
        Ok(())
    }

    #[must_use]
    pub fn check_state(&self, task_id: &str) -> PluginState {
        if self.is_loaded(task_id) {
            PluginState::Loaded
        } else {
            PluginState::NotLoaded
        }
    }

    /// Loaded task ids, sorted.
    #[must_use]
    pub fn loaded_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<_> = self.records.iter().map(|r| r.key().clone()).collect();
        tasks.sort_unstable();
        tasks
    }
}

fn already_loaded(task_id: &str) -> Error {
    Error::AlreadyLoaded {
        task_id: task_id.to_string(),
    }
}

fn unknown_task(task_id: &str) -> Error {
    Error::UnknownTask {
        task_id: task_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        error::{BoxError, FailureReason},
        image::{Image, Manifest},
        symbol::{Object, SymbolTable},
    };

    struct Greeter;

    impl Object for Greeter {
        fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
            Some(self)
        }
    }

    impl Plugin for Greeter {
        fn execute(
            &mut self,
            input: Bytes,
            context: Option<&ExecutionContext>,
        ) -> Result<Bytes, BoxError> {
            if input.is_empty() {
                return Err("empty input".into());
            }
            let prefix = context
                .and_then(|c| c.downcast_ref::<String>())
                .map_or("hello", String::as_str);
            Ok(Bytes::from(format!(
                "{prefix} {}",
                String::from_utf8_lossy(&input)
            )))
        }
    }

    /// Records `detach` calls into a shared log.
    struct Tracked {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Object for Tracked {
        fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
            Some(self)
        }
    }

    impl Plugin for Tracked {
        fn execute(
            &mut self,
            input: Bytes,
            _context: Option<&ExecutionContext>,
        ) -> Result<Bytes, BoxError> {
            Ok(input)
        }

        fn detach(&mut self, context: Option<&ExecutionContext>) {
            let note = context
                .and_then(|c| c.downcast_ref::<String>())
                .cloned()
                .unwrap_or_default();
            self.log.lock().push(format!("detach {note}"));
        }
    }

    fn registry() -> PluginRegistry {
        let catalog = SymbolTable::new().with_factory("greeter", || Greeter);
        PluginRegistry::new(IsolationLoader::new(catalog), Arc::new(SymbolTable::new()))
    }

    fn code(dir: &Path) -> Vec<CodeHandle> {
        let path = dir.join("greeter.img");
        let manifest = Manifest::default().export("com.acme.Greeter", "greeter");
        std::fs::write(&path, Image::encode(&manifest, &[]).unwrap()).unwrap();
        vec![CodeHandle::open("greeter.img", &path, "").unwrap()]
    }

    fn load(registry: &PluginRegistry, dir: &Path, task_id: &str) -> Result<()> {
        registry.load(
            task_id,
            "com.acme.Greeter",
            code(dir),
            Arc::new(IsolationPolicy::default()),
            |_| None,
        )
    }

    #[test]
    fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();

        assert_eq!(registry.check_state("t1"), PluginState::NotLoaded);
        load(&registry, dir.path(), "t1").unwrap();
        assert_eq!(registry.check_state("t1"), PluginState::Loaded);

        let err = load(&registry, dir.path(), "t1").unwrap_err();
        assert_eq!(err.reason(), FailureReason::AlreadyLoaded);
        assert_eq!(
            registry.execute("t1", Bytes::from_static(b"world")).unwrap(),
            "hello world"
        );

        let err = registry.execute("t2", Bytes::new()).unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnknownTask);

        registry.unload("t1").unwrap();
        assert_eq!(registry.check_state("t1"), PluginState::NotLoaded);
        let err = registry.unload("t1").unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnknownTask);
        let err = registry.execute("t1", Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnknownTask);

        load(&registry, dir.path(), "t1").unwrap();
        assert_eq!(registry.check_state("t1"), PluginState::Loaded);
    }

    #[test]
    fn context_reaches_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry
            .load(
                "t1",
                "com.acme.Greeter",
                code(dir.path()),
                Arc::new(IsolationPolicy::default()),
                |task_id| Some(ExecutionContext::new(format!("hi from {task_id},"))),
            )
            .unwrap();

        let out = registry.execute("t1", Bytes::from_static(b"bob")).unwrap();
        assert_eq!(out, "hi from t1, bob");
    }

    #[test]
    fn plugin_failure_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        load(&registry, dir.path(), "t1").unwrap();

        let err = registry.execute("t1", Bytes::new()).unwrap_err();
        assert_eq!(err.reason(), FailureReason::PluginFailed);
        assert_eq!(registry.check_state("t1"), PluginState::Loaded);
    }

    #[test]
    fn failed_load_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let err = registry
            .load(
                "t1",
                "com.acme.Missing",
                code(dir.path()),
                Arc::new(IsolationPolicy::default()),
                |_| None,
            )
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnresolvedSymbol);
        assert_eq!(registry.check_state("t1"), PluginState::NotLoaded);
        assert!(registry.loaded_tasks().is_empty());
    }

    #[test]
    fn unload_detaches_plugin_with_its_context() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let catalog = {
            let log = Arc::clone(&log);
            SymbolTable::new().with_factory("greeter", move || Tracked {
                log: Arc::clone(&log),
            })
        };
        let registry =
            PluginRegistry::new(IsolationLoader::new(catalog), Arc::new(SymbolTable::new()));
        registry
            .load(
                "t1",
                "com.acme.Greeter",
                code(dir.path()),
                Arc::new(IsolationPolicy::default()),
                |task_id| Some(ExecutionContext::new(task_id.to_string())),
            )
            .unwrap();

        registry.execute("t1", Bytes::from_static(b"x")).unwrap();
        assert!(log.lock().is_empty());

        registry.unload("t1").unwrap();
        assert_eq!(*log.lock(), vec!["detach t1".to_string()]);

        // A second unload finds nothing and does not detach again.
        assert!(registry.unload("t1").is_err());
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn lists_loaded_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        for id in ["b", "c", "a"] {
            load(&registry, dir.path(), id).unwrap();
        }
        assert_eq!(registry.loaded_tasks(), vec!["a", "b", "c"]);
    }
}
