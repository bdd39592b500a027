use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure reason reported across the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    CacheIoError,
    ForbiddenSymbol,
    NotAPlugin,
    AlreadyLoaded,
    UnknownTask,
    LoadTimeout,
    InvalidDescriptor,
    InvalidImage,
    UnresolvedSymbol,
    NotReady,
    ServiceFailed,
    PluginFailed,
    Internal,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::CacheIoError => "cache_io_error",
            Self::ForbiddenSymbol => "forbidden_symbol",
            Self::NotAPlugin => "not_a_plugin",
            Self::AlreadyLoaded => "already_loaded",
            Self::UnknownTask => "unknown_task",
            Self::LoadTimeout => "load_timeout",
            Self::InvalidDescriptor => "invalid_descriptor",
            Self::InvalidImage => "invalid_image",
            Self::UnresolvedSymbol => "unresolved_symbol",
            Self::NotReady => "not_ready",
            Self::ServiceFailed => "service_failed",
            Self::PluginFailed => "plugin_failed",
            Self::Internal => "internal",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The descriptor names an owner (or origin) that does not exist.
    #[error("archive origin not found: {what}")]
    NotFound { what: String },

    /// Descriptor names that could escape the cache root or are empty.
    #[error("invalid archive descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    /// Any filesystem failure while reading a source or populating the cache.
    #[error("cache i/o error at {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be decoded into an executable image.
    #[error("invalid image in {archive}: {reason}")]
    InvalidImage { archive: String, reason: String },

    /// The isolation policy denies this symbol outright.
    #[error("symbol is forbidden in an isolated context: {symbol}")]
    ForbiddenSymbol { symbol: String },

    /// Neither the isolation chain nor the plugin's private table has the symbol.
    #[error("unresolved symbol: {symbol}")]
    UnresolvedSymbol { symbol: String },

    #[error("{entry_point} is not a plugin: {reason}")]
    NotAPlugin { entry_point: String, reason: String },

    #[error("task already loaded: {task_id}")]
    AlreadyLoaded { task_id: String },

    #[error("unknown task: {task_id}")]
    UnknownTask { task_id: String },

    #[error("execution host not ready after {}ms", after.as_millis())]
    LoadTimeout { after: Duration },

    /// Readiness was polled from the dispatch thread before it was signalled.
    #[error("execution host is not ready yet")]
    NotReady,

    #[error("execution host failed to start: {cause}")]
    ServiceFailed { cause: String },

    /// Plugin-side failure reported by `execute` (type-erased).
    #[error("plugin for task {task_id} failed: {source}")]
    PluginFailed {
        task_id: String,
        #[source]
        source: BoxError,
    },

    #[error("internal error: {0}")]
    Internal(#[source] BoxError),
}

impl Error {
    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CacheIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_image(archive: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidImage {
            archive: archive.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::NotFound { .. } => FailureReason::NotFound,
            Self::InvalidDescriptor { .. } => FailureReason::InvalidDescriptor,
            Self::CacheIo { .. } => FailureReason::CacheIoError,
            Self::InvalidImage { .. } => FailureReason::InvalidImage,
            Self::ForbiddenSymbol { .. } => FailureReason::ForbiddenSymbol,
            Self::UnresolvedSymbol { .. } => FailureReason::UnresolvedSymbol,
            Self::NotAPlugin { .. } => FailureReason::NotAPlugin,
            Self::AlreadyLoaded { .. } => FailureReason::AlreadyLoaded,
            Self::UnknownTask { .. } => FailureReason::UnknownTask,
            Self::LoadTimeout { .. } => FailureReason::LoadTimeout,
            Self::NotReady => FailureReason::NotReady,
            Self::ServiceFailed { .. } => FailureReason::ServiceFailed,
            Self::PluginFailed { .. } => FailureReason::PluginFailed,
            Self::Internal(_) => FailureReason::Internal,
        }
    }
}
