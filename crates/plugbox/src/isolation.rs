//! Isolation boundary between plugin code and the host.
//!
//! Every lookup a plugin makes goes through an [`IsolatedResolver`]: denied
//! names are forbidden outright, core platform symbols are always visible,
//! host symbols are visible only when allow-listed, and everything else is
//! deferred to the plugin's own [`PrivateLoader`] table.

use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use tracing::{debug, info, info_span};

use crate::{
    TRACE_TARGET,
    code::CodeHandle,
    error::{BoxError, Error, Result},
    image::{Image, Resources},
    symbol::{Plugin, Symbol, SymbolResolver, SymbolTable, platform_symbols},
};

#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    deny: HashSet<String>,
    allow: HashSet<String>,
    /// Pre-normalized: trimmed of whitespace and trailing dots.
    allow_prefixes: Vec<String>,
}

impl IsolationPolicy {
    #[must_use]
    pub fn builder() -> IsolationPolicyBuilder {
        IsolationPolicyBuilder::default()
    }

    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.deny.contains(name)
    }

    /// Exact allow-list hit, or `name` lies in an allow-listed namespace.
    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allow.contains(name)
            || self.allow_prefixes.iter().any(|prefix| {
                name == prefix
                    || name
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct IsolationPolicyBuilder {
    deny: Vec<String>,
    allow: Vec<String>,
    allow_prefixes: Vec<String>,
}

impl IsolationPolicyBuilder {
    #[must_use]
    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.deny.push(name.into());
        self
    }

    #[must_use]
    pub fn deny_all(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.allow.push(name.into());
        self
    }

    #[must_use]
    pub fn allow_all(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn allow_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.allow_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn allow_prefixes(mut self, prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn build(self) -> IsolationPolicy {
        let mut allow_prefixes: Vec<String> = self
            .allow_prefixes
            .iter()
            .map(|p| p.trim().trim_end_matches('.'))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        allow_prefixes.sort_unstable();
        allow_prefixes.dedup();

        IsolationPolicy {
            deny: self.deny.into_iter().collect(),
            allow: self.allow.into_iter().collect(),
            allow_prefixes,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(Symbol),
    Forbidden,
    /// Not visible from the host side; the plugin's own table decides.
    DeferToPluginScope,
}

#[derive(Clone)]
pub struct IsolatedResolver {
    core: Arc<dyn SymbolResolver>,
    host: Arc<dyn SymbolResolver>,
    policy: Arc<IsolationPolicy>,
}

impl core::fmt::Debug for IsolatedResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IsolatedResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl IsolatedResolver {
    pub fn new(
        core: Arc<dyn SymbolResolver>,
        host: Arc<dyn SymbolResolver>,
        policy: Arc<IsolationPolicy>,
    ) -> Self {
        Self { core, host, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Resolution {
        if self.policy.is_denied(name) {
            return Resolution::Forbidden;
        }
        if let Some(symbol) = self.core.resolve(name) {
            return Resolution::Resolved(symbol);
        }
        if self.policy.is_allowed(name)
            && let Some(symbol) = self.host.resolve(name)
        {
            return Resolution::Resolved(symbol);
        }
        Resolution::DeferToPluginScope
    }
}

/// Per-plugin loader: parent-first through the isolated resolver, then the
/// symbols the plugin's own archives export.
pub struct PrivateLoader {
    parent: IsolatedResolver,
    table: SymbolTable,
    resources: Resources,
    archives: Vec<String>,
}

impl core::fmt::Debug for PrivateLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrivateLoader")
            .field("parent", &self.parent)
            .field("table", &self.table)
            .field("resources", &self.resources.len())
            .field("archives", &self.archives)
            .finish()
    }
}

impl PrivateLoader {
    /// # Errors
    /// [`Error::ForbiddenSymbol`] if the policy denies `name`, and
    /// [`Error::UnresolvedSymbol`] if nothing provides it.
    pub fn resolve(&self, name: &str) -> Result<Symbol> {
        match self.parent.resolve(name) {
            Resolution::Resolved(symbol) => Ok(symbol),
            Resolution::Forbidden => Err(Error::ForbiddenSymbol {
                symbol: name.to_string(),
            }),
            Resolution::DeferToPluginScope => {
                self.table
                    .resolve(name)
                    .ok_or_else(|| Error::UnresolvedSymbol {
                        symbol: name.to_string(),
                    })
            }
        }
    }

    /// Resolve `name` and call it as a function.
    ///
    /// # Errors
    /// Resolution failures, a non-function symbol, or the callee's own error.
    pub fn call(&self, name: &str, input: &[u8]) -> Result<Bytes, BoxError> {
        match self.resolve(name)? {
            Symbol::Function(function) => function.call(input),
            Symbol::Factory(_) => Err(format!("{name} is not callable").into()),
        }
    }

    /// Resource bundled in one of the plugin's archives.
    #[must_use]
    pub fn resource(&self, path: &str) -> Option<&Bytes> {
        self.resources.get(path)
    }

    #[must_use]
    pub fn policy(&self) -> &IsolationPolicy {
        self.parent.policy()
    }

    /// Archive names, in load order.
    #[must_use]
    pub fn archives(&self) -> &[String] {
        &self.archives
    }
}

pub struct LoadedPlugin {
    pub plugin: Box<dyn Plugin>,
    pub loader: Arc<PrivateLoader>,
}

impl core::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

pub struct IsolationLoader {
    core: Arc<dyn SymbolResolver>,
    catalog: Arc<SymbolTable>,
}

impl core::fmt::Debug for IsolationLoader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IsolationLoader")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl IsolationLoader {
    /// Loader binding archive exports against `catalog`, with the default
    /// platform symbols as its core set.
    #[must_use]
    pub fn new(catalog: SymbolTable) -> Self {
        Self {
            core: Arc::new(platform_symbols()),
            catalog: Arc::new(catalog),
        }
    }

    #[must_use]
    pub fn with_core(mut self, core: Arc<dyn SymbolResolver>) -> Self {
        self.core = core;
        self
    }

    /// Decode `code`, link its imports and instantiate `entry_point`.
    ///
    /// Every handle is consumed and closed, whether or not the load succeeds.
    ///
    /// # Errors
    /// - [`Error::InvalidImage`] for undecodable archives or unknown catalog
    ///   bindings.
    /// - [`Error::ForbiddenSymbol`] / [`Error::UnresolvedSymbol`] for imports
    ///   or an entry point that cannot be resolved.
    /// - [`Error::NotAPlugin`] if the entry point does not construct a plugin.
    pub fn load(
        &self,
        entry_point: &str,
        code: Vec<CodeHandle>,
        host: Arc<dyn SymbolResolver>,
        policy: Arc<IsolationPolicy>,
    ) -> Result<LoadedPlugin> {
        let span = info_span!(
            target: TRACE_TARGET,
            "isolation.load",
            entry_point,
            archives = code.len()
        );
        let _enter = span.enter();

        let mut table = SymbolTable::new();
        let mut resources = Resources::default();
        let mut imports = Vec::new();
        let mut archives = Vec::with_capacity(code.len());

        for handle in code {
            let (name, primary, mut secondary, _) = handle.into_parts();
            let image = Image::decode(&name, &mut secondary)?;
            secondary.close();
            resources.extend(Resources::read(&name, primary)?);

            for (symbol, implementation) in &image.manifest.exports {
                if table.contains(symbol) {
                    debug!(target: TRACE_TARGET, archive = %name, symbol, "export already bound by an earlier archive");
                    continue;
                }
                let Some(bound) = self.catalog.get(implementation) else {
                    return Err(Error::invalid_image(
                        &name,
                        format!("{symbol} binds unknown implementation {implementation:?}"),
                    ));
                };
                table.insert(symbol.clone(), bound.clone());
            }
            imports.extend(image.manifest.imports);
            archives.push(name);
        }

        let loader = Arc::new(PrivateLoader {
            parent: IsolatedResolver::new(Arc::clone(&self.core), host, policy),
            table,
            resources,
            archives,
        });

        for import in &imports {
            loader.resolve(import)?;
        }

        let factory = match loader.resolve(entry_point)? {
            Symbol::Factory(factory) => factory,
            other => {
                return Err(Error::NotAPlugin {
                    entry_point: entry_point.to_string(),
                    reason: format!("resolved to a {}", other.kind()),
                });
            }
        };
        let mut plugin = factory
            .construct()
            .into_plugin()
            .ok_or_else(|| Error::NotAPlugin {
                entry_point: entry_point.to_string(),
                reason: "constructed object does not implement the plugin capability".to_string(),
            })?;
        plugin.attach(Arc::clone(&loader));

        info!(target: TRACE_TARGET, imports = imports.len(), "plugin instantiated");
        Ok(LoadedPlugin { plugin, loader })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        error::FailureReason,
        image::Manifest,
        symbol::{CORE_LOG, CORE_SHA256, ExecutionContext, Object},
    };

    fn tagged(tag: &'static str) -> impl Fn(&[u8]) -> Result<Bytes, BoxError> + Send + Sync {
        move |_: &[u8]| Ok(Bytes::from_static(tag.as_bytes()))
    }

    fn call(resolution: Resolution) -> Option<Bytes> {
        match resolution {
            Resolution::Resolved(symbol) => symbol.as_function().map(|f| f.call(b"").unwrap()),
            _ => None,
        }
    }

    fn host() -> Arc<dyn SymbolResolver> {
        Arc::new(
            SymbolTable::new()
                .with_function("com.example.Greeter", tagged("host-greeter"))
                .with_function("com.example.secret", tagged("host-secret"))
                .with_function("com.examplefoo.Bar", tagged("host-bar"))
                .with_function("host.internal", tagged("host-internal")),
        )
    }

    fn resolver(policy: IsolationPolicy) -> IsolatedResolver {
        IsolatedResolver::new(Arc::new(platform_symbols()), host(), Arc::new(policy))
    }

    #[test]
    fn prefix_matches_namespace_boundaries() {
        let policy = IsolationPolicy::builder().allow_prefix("com.example.").build();
        assert!(policy.is_allowed("com.example"));
        assert!(policy.is_allowed("com.example.Greeter"));
        assert!(!policy.is_allowed("com.examplefoo.Bar"));
        assert!(!policy.is_allowed("org.other"));
    }

    #[test]
    fn blank_prefixes_are_ignored() {
        let policy = IsolationPolicy::builder().allow_prefix(" . ").allow_prefix("").build();
        assert!(!policy.is_allowed("anything"));
    }

    #[test]
    fn resolution_order() {
        let r = resolver(
            IsolationPolicy::builder()
                .allow_prefix("com.example")
                .deny("com.example.secret")
                .build(),
        );

        assert!(matches!(r.resolve("com.example.secret"), Resolution::Forbidden));
        assert_eq!(call(r.resolve("com.example.Greeter")).unwrap(), "host-greeter");
        assert!(matches!(r.resolve("com.examplefoo.Bar"), Resolution::DeferToPluginScope));
        assert!(matches!(r.resolve("host.internal"), Resolution::DeferToPluginScope));
        assert!(matches!(r.resolve(CORE_SHA256), Resolution::Resolved(_)));
    }

    #[test]
    fn deny_applies_to_core_symbols() {
        let r = resolver(IsolationPolicy::builder().deny(CORE_LOG).build());
        assert!(matches!(r.resolve(CORE_LOG), Resolution::Forbidden));
    }

    #[test]
    fn private_table_never_overrides_forbidden() {
        let loader = PrivateLoader {
            parent: resolver(
                IsolationPolicy::builder()
                    .allow("com.example.secret")
                    .deny("com.example.secret")
                    .build(),
            ),
            table: SymbolTable::new()
                .with_function("com.example.secret", tagged("plugin-secret"))
                .with_function("host.internal", tagged("plugin-internal")),
            resources: Resources::default(),
            archives: Vec::new(),
        };

        let err = loader.resolve("com.example.secret").unwrap_err();
        assert_eq!(err.reason(), FailureReason::ForbiddenSymbol);

        // Not allow-listed: the plugin sees its own definition, never the host's.
        assert_eq!(loader.call("host.internal", b"").unwrap(), "plugin-internal");

        let err = loader.resolve("com.example.Missing").unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnresolvedSymbol);
    }

    struct Echo {
        loader: Option<Arc<PrivateLoader>>,
    }

    impl Object for Echo {
        fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
            Some(self)
        }
    }

    impl Plugin for Echo {
        fn attach(&mut self, loader: Arc<PrivateLoader>) {
            self.loader = Some(loader);
        }

        fn execute(
            &mut self,
            input: Bytes,
            _context: Option<&ExecutionContext>,
        ) -> Result<Bytes, BoxError> {
            let loader = self.loader.as_ref().ok_or("not attached")?;
            let greeting = loader.resource("greeting.txt").cloned().unwrap_or_default();
            Ok(Bytes::from([greeting.as_ref(), input.as_ref()].concat()))
        }
    }

    struct Inert;

    impl Object for Inert {}

    fn catalog() -> SymbolTable {
        SymbolTable::new()
            .with_factory("echo", || Echo { loader: None })
            .with_factory("inert", || Inert)
            .with_function("first", tagged("first"))
            .with_function("second", tagged("second"))
    }

    fn handle(dir: &Path, name: &str, manifest: &Manifest, resources: &[(&str, &[u8])]) -> CodeHandle {
        let path = dir.join(name);
        std::fs::write(&path, Image::encode(manifest, resources).unwrap()).unwrap();
        CodeHandle::open(name, &path, "").unwrap()
    }

    fn load(
        manifests: &[(&str, Manifest)],
        entry_point: &str,
        policy: IsolationPolicy,
    ) -> Result<LoadedPlugin> {
        let dir = tempfile::tempdir().unwrap();
        let code = manifests
            .iter()
            .map(|(name, m)| handle(dir.path(), name, m, &[("greeting.txt", &b"hi "[..])]))
            .collect();
        IsolationLoader::new(catalog()).load(entry_point, code, host(), Arc::new(policy))
    }

    #[test]
    fn loads_and_attaches() {
        let manifest = Manifest::default()
            .export("com.acme.Echo", "echo")
            .import(CORE_LOG)
            .import("com.example.Greeter");
        let mut loaded = load(
            &[("echo.img", manifest)],
            "com.acme.Echo",
            IsolationPolicy::builder().allow("com.example.Greeter").build(),
        )
        .unwrap();

        let out = loaded.plugin.execute(Bytes::from_static(b"there"), None).unwrap();
        assert_eq!(out, "hi there");
        assert_eq!(loaded.loader.archives(), ["echo.img".to_string()]);
    }

    #[test]
    fn first_archive_wins() {
        let a = Manifest::default()
            .export("com.acme.Echo", "echo")
            .export("com.acme.which", "first");
        let b = Manifest::default().export("com.acme.which", "second");
        let loaded = load(
            &[("a.img", a), ("b.img", b)],
            "com.acme.Echo",
            IsolationPolicy::default(),
        )
        .unwrap();
        assert_eq!(loaded.loader.call("com.acme.which", b"").unwrap(), "first");
    }

    #[test]
    fn forbidden_import_fails_load() {
        let manifest = Manifest::default()
            .export("com.acme.Echo", "echo")
            .import("com.example.secret");
        let err = load(
            &[("echo.img", manifest)],
            "com.acme.Echo",
            IsolationPolicy::builder()
                .allow_prefix("com.example")
                .deny("com.example.secret")
                .build(),
        )
        .unwrap_err();
        assert_eq!(err.reason(), FailureReason::ForbiddenSymbol);
    }

    #[test]
    fn host_symbol_outside_allow_list_is_unresolved() {
        let manifest = Manifest::default()
            .export("com.acme.Echo", "echo")
            .import("host.internal");
        let err = load(&[("echo.img", manifest)], "com.acme.Echo", IsolationPolicy::default())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnresolvedSymbol);
    }

    #[test]
    fn entry_point_must_construct_a_plugin() {
        let manifest = Manifest::default()
            .export("com.acme.Inert", "inert")
            .export("com.acme.fn", "first");

        let err = load(&[("x.img", manifest.clone())], "com.acme.Inert", IsolationPolicy::default())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::NotAPlugin);

        let err = load(&[("x.img", manifest)], "com.acme.fn", IsolationPolicy::default())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::NotAPlugin);
    }

    #[test]
    fn unknown_implementation_is_invalid_image() {
        let manifest = Manifest::default().export("com.acme.Echo", "missing");
        let err = load(&[("x.img", manifest)], "com.acme.Echo", IsolationPolicy::default())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidImage);
    }

    #[test]
    fn missing_entry_point_is_unresolved() {
        let manifest = Manifest::default().export("com.acme.Echo", "echo");
        let err = load(&[("x.img", manifest)], "com.acme.Other", IsolationPolicy::default())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnresolvedSymbol);
    }
}
