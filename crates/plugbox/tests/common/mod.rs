#![allow(dead_code)]

use std::{fs, path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use plugbox::{
    BoxError, Config, ExecutionContext, HostPolicyProvider, Image, Manifest, Object, Plugin,
    PluginService, PrivateLoader, SymbolTable, checksum::sidecar_name,
};
use tempfile::TempDir;

pub const ECHO: &str = "com.acme.Echo";
pub const SPY: &str = "com.acme.Spy";

/// Echoes its input behind a prefix taken from the execution context, or from
/// the `prefix.txt` resource when there is no context.
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
        context: Option<&ExecutionContext>,
    ) -> Result<Bytes, BoxError> {
        let loader = self.loader.as_ref().ok_or("not attached")?;
        loader.call("core.log", &input)?;
        let prefix = match context.and_then(|c| c.downcast_ref::<Bytes>()) {
            Some(prefix) => prefix.clone(),
            None => loader.resource("prefix.txt").cloned().unwrap_or_default(),
        };
        Ok(Bytes::from([prefix.as_ref(), input.as_ref()].concat()))
    }
}

/// Reports which host symbols it can reach at runtime.
struct Spy {
    loader: Option<Arc<PrivateLoader>>,
}

impl Object for Spy {
    fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
        Some(self)
    }
}

impl Plugin for Spy {
    fn attach(&mut self, loader: Arc<PrivateLoader>) {
        self.loader = Some(loader);
    }

    fn execute(
        &mut self,
        input: Bytes,
        _context: Option<&ExecutionContext>,
    ) -> Result<Bytes, BoxError> {
        let loader = self.loader.as_ref().ok_or("not attached")?;
        let symbol = String::from_utf8_lossy(&input).into_owned();
        Ok(loader
            .call(&symbol, b"")
            .unwrap_or_else(|err| Bytes::from(format!("blocked: {err}"))))
    }
}

pub fn catalog() -> SymbolTable {
    SymbolTable::new()
        .with_factory("echo", || Echo { loader: None })
        .with_factory("spy", || Spy { loader: None })
        .with_function("local-secret", |_| Ok(Bytes::from_static(b"plugin secret")))
}

pub fn host_symbols() -> SymbolTable {
    SymbolTable::new()
        .with_function("host.greet", |_| Ok(Bytes::from_static(b"greetings")))
        .with_function("host.secret", |_| Ok(Bytes::from_static(b"host secret")))
}

pub fn echo_archive() -> Vec<u8> {
    let manifest = Manifest::default().export(ECHO, "echo").import("core.log");
    Image::encode(&manifest, &[("prefix.txt", &b"echo: "[..])]).unwrap()
}

pub fn spy_archive() -> Vec<u8> {
    let manifest = Manifest::default()
        .export(SPY, "spy")
        .export("host.secret", "local-secret");
    Image::encode(&manifest, &[]).unwrap()
}

/// Temporary assets/packages/cache tree laid out like [`Config::new`].
pub struct Sandbox {
    _root: TempDir,
    pub config: Config,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = Config::new(root.path().join("cache")).ready_timeout(Duration::from_secs(5));
        fs::create_dir_all(&config.assets_dir).unwrap();
        fs::create_dir_all(&config.packages_dir).unwrap();
        Self {
            _root: root,
            config,
        }
    }

    pub fn bundled(&self, name: &str, bytes: &[u8], checksum: Option<&str>) {
        write_asset(&self.config.assets_dir, name, bytes, checksum);
    }

    pub fn external(&self, owner: &str, name: &str, bytes: &[u8], checksum: Option<&str>) {
        let dir = self.config.packages_dir.join(owner).join("assets");
        fs::create_dir_all(&dir).unwrap();
        write_asset(&dir, name, bytes, checksum);
    }

    pub fn installed(&self, owner: &str, bytes: &[u8]) {
        let dir = self.config.packages_dir.join(owner);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("base.img"), bytes).unwrap();
    }

    pub fn service(&self, policy: impl HostPolicyProvider) -> PluginService {
        PluginService::builder(self.config.clone())
            .catalog(catalog())
            .host_symbols(Arc::new(host_symbols()))
            .policy_provider(Arc::new(policy))
            .build()
    }
}

fn write_asset(dir: &Path, name: &str, bytes: &[u8], checksum: Option<&str>) {
    fs::write(dir.join(name), bytes).unwrap();
    let sidecar = dir.join(sidecar_name(name));
    match checksum {
        Some(checksum) => fs::write(sidecar, checksum).unwrap(),
        None => {
            let _ = fs::remove_file(sidecar);
        }
    }
}
