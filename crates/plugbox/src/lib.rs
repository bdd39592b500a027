//! Dynamic plugin loading behind an allow-listed isolation boundary.
//!
//! Archives are resolved from their origin, cached locally with a checksum
//! sidecar, decoded into images whose exports bind to host-compiled
//! implementations, and instantiated through a resolver chain that only lets
//! approved host symbols through.

pub mod cache;
pub mod checksum;
pub mod code;
pub mod config;
pub mod error;
pub mod image;
pub mod isolation;
pub mod readiness;
pub mod registry;
pub mod service;
pub mod source;
pub mod symbol;

pub const TRACE_TARGET: &str = "plugbox";
pub const TRACE_TARGET_PLUGIN: &str = "plugbox::plugin";

pub use cache::{ArchiveCache, CacheEntry, CacheStats};
pub use checksum::combined_checksum;
pub use code::{CodeHandle, PrimaryHandle, SecondaryHandle};
pub use config::Config;
pub use error::{BoxError, Error, FailureReason, Result};
pub use image::{Image, Manifest, Resources};
pub use isolation::{
    IsolatedResolver, IsolationLoader, IsolationPolicy, IsolationPolicyBuilder, LoadedPlugin,
    PrivateLoader, Resolution,
};
pub use readiness::{Readiness, ReadinessGate};
pub use registry::{PluginRegistry, PluginState};
pub use service::{
    AllowedSymbols, HostPolicyProvider, LoadAck, LoadRequest, PluginService,
    PluginServiceBuilder, StaticPolicy,
};
pub use source::{
    ArchiveDescriptor, ArchiveOriginReader, ArchiveSourceResolver, ArchiveStreams,
    DirectoryOrigin, ResolvedArchive,
};
pub use symbol::{
    ExecutionContext, Factory, Function, Object, Plugin, Symbol, SymbolResolver, SymbolTable,
    platform_symbols,
};
