use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};

pub const ENV_CACHE_DIR: &str = "PLUGBOX_CACHE_DIR";
pub const ENV_ASSETS_DIR: &str = "PLUGBOX_ASSETS_DIR";
pub const ENV_PACKAGES_DIR: &str = "PLUGBOX_PACKAGES_DIR";
pub const ENV_READY_TIMEOUT_MS: &str = "PLUGBOX_READY_TIMEOUT_MS";

const DEFAULT_READY_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ROOT: &str = "plugbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Process-local cache area holding archive copies and their sidecars.
    pub cache_dir: PathBuf,
    /// Assets shipped with the host.
    pub assets_dir: PathBuf,
    /// One directory per installed component.
    pub packages_dir: PathBuf,
    /// How long a worker waits for the execution host before giving up.
    pub ready_timeout: Duration,
}

impl Config {
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(DEFAULT_READY_TIMEOUT_MS);

    /// Defaults rooted next to `cache_dir`.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        let parent = cache_dir
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);
        Self {
            assets_dir: parent.join("assets"),
            packages_dir: parent.join("packages"),
            cache_dir,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve every setting through `lookup`; invalid values fall back to
    /// defaults with a warning.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let (cache_dir, cache_dir_source) = match lookup(ENV_CACHE_DIR) {
            Some(value) if !value.trim().is_empty() => (PathBuf::from(value), "env"),
            Some(_) => (default_cache_dir(), "default_empty_env"),
            None => (default_cache_dir(), "default"),
        };
        let defaults = Self::new(&cache_dir);

        let (assets_dir, assets_dir_source) = match lookup(ENV_ASSETS_DIR) {
            Some(value) if !value.trim().is_empty() => (PathBuf::from(value), "env"),
            _ => (defaults.assets_dir, "derived"),
        };

        let (packages_dir, packages_dir_source) = match lookup(ENV_PACKAGES_DIR) {
            Some(value) if !value.trim().is_empty() => (PathBuf::from(value), "env"),
            _ => (defaults.packages_dir, "derived"),
        };

        let (ready_timeout, ready_timeout_source) = lookup(ENV_READY_TIMEOUT_MS).map_or(
            (Self::DEFAULT_READY_TIMEOUT, "default"),
            |raw| match raw.trim().parse::<u64>() {
                Ok(ms) => (Duration::from_millis(ms), "env"),
                Err(err) => {
                    warn!(
                        %raw,
                        ?err,
                        "Invalid PLUGBOX_READY_TIMEOUT_MS; falling back to default"
                    );
                    (Self::DEFAULT_READY_TIMEOUT, "default_invalid_env")
                }
            },
        );

        info!(
            cache_dir = %cache_dir.display(),
            cache_dir_source,
            assets_dir = %assets_dir.display(),
            assets_dir_source,
            packages_dir = %packages_dir.display(),
            packages_dir_source,
            ready_timeout_ms = ready_timeout.as_millis(),
            ready_timeout_source,
            "Resolved plugbox configuration"
        );

        Self {
            cache_dir,
            assets_dir,
            packages_dir,
            ready_timeout,
        }
    }

    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_ROOT).join("cache")
}
