//! Symbols that can cross the isolation boundary.
//!
//! Plugin implementations are compiled into the host and registered by name in
//! a catalog. A [`Symbol::Factory`] builds a fresh [`Object`] without
//! arguments; a [`Symbol::Function`] is a plain byte-in/byte-out callable.

use std::{any::Any, collections::HashMap, sync::Arc};

use bytes::Bytes;
use tracing::info;

use crate::{TRACE_TARGET_PLUGIN, checksum, error::BoxError, isolation::PrivateLoader};

pub const CORE_LOG: &str = "core.log";
pub const CORE_SHA256: &str = "core.sha256";

/// Anything a factory can produce.
pub trait Object: Send + 'static {
    /// Convert into the plugin capability. Objects that are not plugins keep
    /// the default.
    fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
        None
    }
}

pub trait Plugin: Send + 'static {
    /// Called once after construction with the loader that resolved the
    /// plugin. Later lookups must go through it.
    fn attach(&mut self, loader: Arc<PrivateLoader>) {
        let _ = loader;
    }

    /// # Errors
    /// Plugin-defined; reported to the caller as a plugin failure.
    fn execute(
        &mut self,
        input: Bytes,
        context: Option<&ExecutionContext>,
    ) -> Result<Bytes, BoxError>;

    /// Shutdown hook, called once on unload before the plugin is dropped.
    fn detach(&mut self, context: Option<&ExecutionContext>) {
        let _ = context;
    }
}

#[derive(Clone)]
pub struct Factory(Arc<dyn Fn() -> Box<dyn Object> + Send + Sync>);

impl Factory {
    pub fn new<F, O>(f: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: Object,
    {
        Self(Arc::new(move || Box::new(f()) as Box<dyn Object>))
    }

    #[must_use]
    pub fn construct(&self) -> Box<dyn Object> {
        (self.0)()
    }
}

type FunctionImpl = dyn Fn(&[u8]) -> Result<Bytes, BoxError> + Send + Sync;

#[derive(Clone)]
pub struct Function(Arc<FunctionImpl>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// # Errors
    /// Whatever the wrapped callable returns.
    pub fn call(&self, input: &[u8]) -> Result<Bytes, BoxError> {
        (self.0)(input)
    }
}

#[derive(Clone)]
pub enum Symbol {
    Factory(Factory),
    Function(Function),
}

impl Symbol {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Factory(_) => "factory",
            Self::Function(_) => "function",
        }
    }

    #[must_use]
    pub const fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(f) => Some(f),
            Self::Factory(_) => None,
        }
    }
}

impl core::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Symbol").field(&self.kind()).finish()
    }
}

/// Opaque host value handed to a plugin on every `execute`.
#[derive(Clone)]
pub struct ExecutionContext(Arc<dyn Any + Send + Sync>);

impl ExecutionContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl core::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Symbol>;
}

impl<T: SymbolResolver + ?Sized> SymbolResolver for Arc<T> {
    fn resolve(&self, name: &str) -> Option<Symbol> {
        (**self).resolve(name)
    }
}

#[derive(Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: impl Into<String>, symbol: Symbol) {
        self.symbols.insert(name.into(), symbol);
    }

    #[must_use]
    pub fn with_factory<F, O>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: Object,
    {
        self.insert(name, Symbol::Factory(Factory::new(f)));
        self
    }

    #[must_use]
    pub fn with_function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Bytes, BoxError> + Send + Sync + 'static,
    {
        self.insert(name, Symbol::Function(Function::new(f)));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Sorted symbol names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.symbols.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).cloned()
    }
}

impl core::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("symbols", &self.names())
            .finish()
    }
}

/// Symbols every plugin can reach regardless of policy, unless denied.
#[must_use]
pub fn platform_symbols() -> SymbolTable {
    SymbolTable::new()
        .with_function(CORE_LOG, |input| {
            info!(target: TRACE_TARGET_PLUGIN, "{}", String::from_utf8_lossy(input));
            Ok(Bytes::new())
        })
        .with_function(CORE_SHA256, |input| {
            Ok(Bytes::from(checksum::digest(input)))
        })
}
