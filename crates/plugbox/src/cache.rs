//! Local cache of plugin archives keyed by name and validated by checksum.
//!
//! Layout under the cache root is one archive file plus one checksum sidecar
//! per archive name (`<name>` and `<name>.md5`). Content is always written before metadata: the old
//! sidecar is removed, the new content is renamed into place from a temporary
//! file, and only then is the new sidecar written. A crash at any point leaves
//! either the previous valid entry or a file without a sidecar, and a missing
//! or mismatched sidecar always forces a fresh copy.

use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info_span};

use crate::{
    TRACE_TARGET,
    checksum::cache_sidecar_name,
    code::CodeHandle,
    error::{Error, Result},
    source::{ArchiveDescriptor, ArchiveOriginReader, ArchiveSourceResolver, ResolvedArchive},
};

/// Paths occupied by one archive in the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    pub file: PathBuf,
    pub sidecar: PathBuf,
}

impl CacheEntry {
    fn new(root: &Path, name: String) -> Self {
        let sidecar = root.join(cache_sidecar_name(&name));
        Self {
            file: root.join(&name),
            sidecar,
            name,
        }
    }

    /// Checksum recorded next to the cached copy, if any.
    #[must_use]
    pub fn cached_checksum(&self) -> Option<String> {
        fs::read_to_string(&self.sidecar).ok()
    }

    fn is_reusable(&self, expected: &str) -> bool {
        !expected.is_empty()
            && self.file.is_file()
            && self.cached_checksum().is_some_and(|cached| cached == expected)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Archives copied from their origin.
    pub copies: u64,
    /// Materializations served from an existing cache entry.
    pub reuses: u64,
}

pub struct ArchiveCache {
    root: PathBuf,
    resolver: ArchiveSourceResolver,
    locks: DashMap<String, Arc<Mutex<()>>>,
    copies: AtomicU64,
    reuses: AtomicU64,
}

impl core::fmt::Debug for ArchiveCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchiveCache")
            .field("root", &self.root)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ArchiveCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, origin: Arc<dyn ArchiveOriginReader>) -> Self {
        Self {
            root: root.into(),
            resolver: ArchiveSourceResolver::new(origin),
            locks: DashMap::new(),
            copies: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            copies: self.copies.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidDescriptor`] for names that are not plain file names.
    pub fn entry(&self, descriptor: &ArchiveDescriptor) -> Result<CacheEntry> {
        Ok(CacheEntry::new(&self.root, descriptor.cache_file_name()?))
    }

    /// Make `descriptor` available in the cache and open both handles on it.
    ///
    /// Bundled and named assets are reused when the cached sidecar matches the
    /// source checksum. Installed images, and anything whose checksum is
    /// unknown, are copied every time.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown owner, [`Error::CacheIo`] for any
    /// filesystem failure, [`Error::InvalidDescriptor`] for unsafe names.
    pub fn materialize(&self, descriptor: &ArchiveDescriptor) -> Result<CodeHandle> {
        let span = info_span!(target: TRACE_TARGET, "cache.materialize", archive = %descriptor);
        let _enter = span.enter();

        let entry = self.entry(descriptor)?;
        let lock = self.lock_for(&entry.name);
        let _guard = lock.lock();

        fs::create_dir_all(&self.root).map_err(|e| Error::cache_io(&self.root, e))?;

        let resolved = self.resolver.resolve(descriptor)?;
        if entry.is_reusable(&resolved.checksum) {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            debug!(target: TRACE_TARGET, checksum = %resolved.checksum, "reusing cached archive");
            return CodeHandle::open(entry.name, &entry.file, resolved.checksum);
        }

        debug!(
            target: TRACE_TARGET,
            checksum = %resolved.checksum,
            path = %entry.file.display(),
            "copying archive into cache"
        );
        let checksum = resolved.checksum.clone();
        refresh(&entry, resolved)?;
        self.copies.fetch_add(1, Ordering::Relaxed);
        CodeHandle::open(entry.name, &entry.file, checksum)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }
}

fn refresh(entry: &CacheEntry, resolved: ResolvedArchive) -> Result<()> {
    let ResolvedArchive {
        mut bytes,
        checksum,
    } = resolved;

    match fs::remove_file(&entry.sidecar) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::cache_io(&entry.sidecar, e)),
    }

    write_atomic(&entry.file, &mut bytes)?;
    if !checksum.is_empty() {
        write_atomic(&entry.sidecar, &mut checksum.as_bytes())?;
    }
    Ok(())
}

/// Copy `src` into a temporary sibling of `dest` and rename it into place.
fn write_atomic(dest: &Path, src: &mut dyn Read) -> Result<()> {
    static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let sequence = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let file_name = dest
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("archive");
    let tmp_path = dest.with_file_name(format!(
        ".{file_name}.tmp-{}-{sequence}",
        std::process::id()
    ));

    match copy_to(&tmp_path, src).and_then(|()| fs::rename(&tmp_path, dest)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(Error::cache_io(dest, e))
        }
    }
}

fn copy_to(path: &Path, src: &mut dyn Read) -> io::Result<()> {
    let mut file = File::create(path)?;
    io::copy(src, &mut file)?;
    file.sync_all()
}
