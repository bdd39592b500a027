//! Archive origins and the resolver that turns a descriptor into bytes.

use std::{
    fs::File,
    io::{self, Read},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    checksum::sidecar_name,
    config::Config,
    error::{Error, Result},
};

/// File name given to an installed image when it is copied into the cache.
const INSTALLED_IMAGE_EXTENSION: &str = "img";

/// Where a plugin archive comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveDescriptor {
    /// Shipped with the host itself.
    BundledAsset { name: String },
    /// Bundled inside another installed component.
    NamedExternalAsset { owner: String, name: String },
    /// The primary executable image of an installed component.
    InstalledImage { owner: String },
}

impl ArchiveDescriptor {
    #[must_use]
    pub fn bundled(name: impl Into<String>) -> Self {
        Self::BundledAsset { name: name.into() }
    }

    #[must_use]
    pub fn external(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NamedExternalAsset {
            owner: owner.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn installed(owner: impl Into<String>) -> Self {
        Self::InstalledImage {
            owner: owner.into(),
        }
    }

    /// Whether a checksum sidecar can exist for this descriptor.
    #[must_use]
    pub const fn has_sidecar(&self) -> bool {
        !matches!(self, Self::InstalledImage { .. })
    }

    /// Name of the file this archive occupies in the cache root.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDescriptor`] if a name or owner is not a single
    /// plain path component.
    pub fn cache_file_name(&self) -> Result<String> {
        match self {
            Self::BundledAsset { name } => plain_component("name", name).map(str::to_string),
            Self::NamedExternalAsset { owner, name } => {
                plain_component("owner", owner)?;
                plain_component("name", name).map(str::to_string)
            }
            Self::InstalledImage { owner } => {
                plain_component("owner", owner)?;
                Ok(format!("{owner}.{INSTALLED_IMAGE_EXTENSION}"))
            }
        }
    }
}

impl core::fmt::Display for ArchiveDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BundledAsset { name } => write!(f, "bundled:{name}"),
            Self::NamedExternalAsset { owner, name } => write!(f, "{owner}:{name}"),
            Self::InstalledImage { owner } => write!(f, "installed:{owner}"),
        }
    }
}

fn plain_component<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == value => Ok(value),
        _ => Err(Error::InvalidDescriptor {
            reason: format!("{field} must be a plain file name, got {value:?}"),
        }),
    }
}

/// Raw streams handed out by an origin.
pub struct ArchiveStreams {
    pub bytes: Box<dyn Read + Send>,
    /// `None` when the origin has no sidecar for this archive.
    pub checksum: Option<Box<dyn Read + Send>>,
}

impl core::fmt::Debug for ArchiveStreams {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveStreams")
            .field("bytes", &"<stream>")
            .field("checksum", &self.checksum.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

/// Supplies archive bytes for a descriptor.
pub trait ArchiveOriginReader: Send + Sync + 'static {
    /// # Errors
    /// [`Error::NotFound`] for an unknown owner; [`Error::CacheIo`] when the
    /// archive itself cannot be opened.
    fn open(&self, descriptor: &ArchiveDescriptor) -> Result<ArchiveStreams>;
}

impl<T: ArchiveOriginReader + ?Sized> ArchiveOriginReader for Arc<T> {
    fn open(&self, descriptor: &ArchiveDescriptor) -> Result<ArchiveStreams> {
        (**self).open(descriptor)
    }
}

/// Archive bytes together with the checksum the origin vouches for.
pub struct ResolvedArchive {
    pub bytes: Box<dyn Read + Send>,
    /// Empty when unknown.
    pub checksum: String,
}

impl core::fmt::Debug for ResolvedArchive {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolvedArchive")
            .field("bytes", &"<stream>")
            .field("checksum", &self.checksum)
            .finish()
    }
}

#[derive(Clone)]
pub struct ArchiveSourceResolver {
    origin: Arc<dyn ArchiveOriginReader>,
}

impl core::fmt::Debug for ArchiveSourceResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveSourceResolver").finish_non_exhaustive()
    }
}

impl ArchiveSourceResolver {
    #[must_use]
    pub fn new(origin: Arc<dyn ArchiveOriginReader>) -> Self {
        Self { origin }
    }

    /// # Errors
    /// Propagates origin failures. A missing or unreadable sidecar is not an
    /// error: the checksum is reported as unknown instead.
    pub fn resolve(&self, descriptor: &ArchiveDescriptor) -> Result<ResolvedArchive> {
        let ArchiveStreams { bytes, checksum } = self.origin.open(descriptor)?;
        let checksum = if descriptor.has_sidecar() {
            checksum.map(read_checksum).unwrap_or_default()
        } else {
            // Installed images are identified by owner only; there is no
            // stable name to version them by.
            String::new()
        };
        Ok(ResolvedArchive { bytes, checksum })
    }
}

fn read_checksum(mut stream: Box<dyn Read + Send>) -> String {
    let mut out = String::new();
    match stream.read_to_string(&mut out) {
        Ok(_) => out,
        Err(err) => {
            tracing::debug!(target: crate::TRACE_TARGET, %err, "unreadable checksum sidecar, treating as unknown");
            String::new()
        }
    }
}

/// Filesystem origin.
///
/// ```text
/// <assets_dir>/<name>                         bundled asset
/// <assets_dir>/<stem>.md5                     its sidecar
/// <packages_dir>/<owner>/assets/<name>        named external asset (+ sidecar)
/// <packages_dir>/<owner>/base.img             installed image
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryOrigin {
    assets_dir: PathBuf,
    packages_dir: PathBuf,
}

impl DirectoryOrigin {
    pub const INSTALLED_IMAGE: &'static str = "base.img";
    pub const ASSETS: &'static str = "assets";

    #[must_use]
    pub fn new(assets_dir: impl Into<PathBuf>, packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            packages_dir: packages_dir.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.assets_dir, &config.packages_dir)
    }

    fn owner_dir(&self, owner: &str) -> Result<PathBuf> {
        let dir = self.packages_dir.join(owner);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::NotFound {
                what: format!("owner {owner}"),
            })
        }
    }

    fn open_asset(dir: &Path, name: &str) -> Result<ArchiveStreams> {
        let path = dir.join(name);
        let bytes = File::open(&path).map_err(|e| Error::cache_io(&path, e))?;
        let checksum = match File::open(dir.join(sidecar_name(name))) {
            Ok(file) => Some(Box::new(file) as Box<dyn Read + Send>),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(Error::cache_io(dir.join(sidecar_name(name)), err)),
        };
        Ok(ArchiveStreams {
            bytes: Box::new(bytes),
            checksum,
        })
    }
}

impl ArchiveOriginReader for DirectoryOrigin {
    fn open(&self, descriptor: &ArchiveDescriptor) -> Result<ArchiveStreams> {
        // Reject traversal before touching the filesystem.
        descriptor.cache_file_name()?;
        match descriptor {
            ArchiveDescriptor::BundledAsset { name } => Self::open_asset(&self.assets_dir, name),
            ArchiveDescriptor::NamedExternalAsset { owner, name } => {
                let dir = self.owner_dir(owner)?.join(Self::ASSETS);
                Self::open_asset(&dir, name)
            }
            ArchiveDescriptor::InstalledImage { owner } => {
                let path = self.owner_dir(owner)?.join(Self::INSTALLED_IMAGE);
                let bytes = File::open(&path).map_err(|e| Error::cache_io(&path, e))?;
                Ok(ArchiveStreams {
                    bytes: Box::new(bytes),
                    checksum: None,
                })
            }
        }
    }
}
