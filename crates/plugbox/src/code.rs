//! Read handles over a materialized archive.
//!
//! Every archive is opened twice. The [`PrimaryHandle`] is a forward-only
//! stream that the isolation boundary consumes exactly once; it is never
//! duplicated or rewound. The [`SecondaryHandle`] is positioned independently
//! and can seek, which the image decoder needs to parse the archive locally.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PrimaryHandle {
    file: File,
}

impl PrimaryHandle {
    /// Release the underlying file descriptor.
    pub fn close(self) {
        drop(self.file);
    }
}

impl Read for PrimaryHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[derive(Debug)]
pub struct SecondaryHandle {
    file: File,
}

impl SecondaryHandle {
    /// Release the underlying file descriptor.
    pub fn close(self) {
        drop(self.file);
    }
}

impl Read for SecondaryHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SecondaryHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// One resolved archive: two independent handles plus its checksum.
///
/// An empty checksum means "unknown".
#[derive(Debug)]
pub struct CodeHandle {
    name: String,
    primary: PrimaryHandle,
    secondary: SecondaryHandle,
    checksum: String,
}

impl CodeHandle {
    /// Open both handles on `path`. Each open gets its own file offset.
    ///
    /// # Errors
    /// Returns [`Error::CacheIo`] if either handle cannot be opened.
    pub fn open(name: impl Into<String>, path: &Path, checksum: impl Into<String>) -> Result<Self> {
        let primary = File::open(path).map_err(|e| Error::cache_io(path, e))?;
        let secondary = File::open(path).map_err(|e| Error::cache_io(path, e))?;
        Ok(Self {
            name: name.into(),
            primary: PrimaryHandle { file: primary },
            secondary: SecondaryHandle { file: secondary },
            checksum: checksum.into(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    #[must_use]
    pub fn has_known_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Split into owned parts; each handle is then closed by whoever holds it.
    #[must_use]
    pub fn into_parts(self) -> (String, PrimaryHandle, SecondaryHandle, String) {
        (self.name, self.primary, self.secondary, self.checksum)
    }

    /// Close both handles.
    pub fn close(self) {
        let (_, primary, secondary, _) = self.into_parts();
        primary.close();
        secondary.close();
    }
}
