//! Plugins compiled into the `plugbox` binary.

use std::sync::Arc;

use bytes::Bytes;
use plugbox::{
    BoxError, ExecutionContext, Object, Plugin, PrivateLoader, SymbolTable,
    symbol::{CORE_LOG, CORE_SHA256},
};

pub const ECHO: &str = "echo";
pub const DIGEST: &str = "digest";

pub fn catalog() -> SymbolTable {
    SymbolTable::new()
        .with_factory(ECHO, || Echo { loader: None })
        .with_factory(DIGEST, || Digest { loader: None })
}

/// Prefixes the input with the context init bytes, or with the archive's
/// `prefix.txt` resource.
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
        let loader = self.loader.as_ref().ok_or("echo: not attached")?;
        let prefix = match context.and_then(|c| c.downcast_ref::<Bytes>()) {
            Some(prefix) => prefix.clone(),
            None => loader.resource("prefix.txt").cloned().unwrap_or_default(),
        };
        loader.call(CORE_LOG, &input)?;
        Ok(Bytes::from([prefix.as_ref(), input.as_ref()].concat()))
    }
}

struct Digest {
    loader: Option<Arc<PrivateLoader>>,
}

impl Object for Digest {
    fn into_plugin(self: Box<Self>) -> Option<Box<dyn Plugin>> {
        Some(self)
    }
}

impl Plugin for Digest {
    fn attach(&mut self, loader: Arc<PrivateLoader>) {
        self.loader = Some(loader);
    }

    fn execute(
        &mut self,
        input: Bytes,
        _context: Option<&ExecutionContext>,
    ) -> Result<Bytes, BoxError> {
        let loader = self.loader.as_ref().ok_or("digest: not attached")?;
        loader.call(CORE_SHA256, &input)
    }
}
