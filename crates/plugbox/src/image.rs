//! Executable image format.
//!
//! An archive is a zip file whose `plugin.json` manifest binds exported symbol
//! names to catalog implementations and lists the symbols the plugin imports.
//! Every other entry is a resource the plugin can read at runtime.

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Read, Seek, Write as _},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MANIFEST: &str = "plugin.json";

/// Upper bound on an archive read through the forward-only handle.
pub const MAX_ARCHIVE_SIZE: u64 = 256 * 1024 * 1024;
/// Upper bound on one decompressed resource.
pub const MAX_RESOURCE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Symbol name -> catalog implementation id.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Symbols the plugin expects to reach across the isolation boundary.
    #[serde(default)]
    pub imports: Vec<String>,
}

impl Manifest {
    #[must_use]
    pub fn export(mut self, symbol: impl Into<String>, implementation: impl Into<String>) -> Self {
        self.exports.insert(symbol.into(), implementation.into());
        self
    }

    #[must_use]
    pub fn import(mut self, symbol: impl Into<String>) -> Self {
        self.imports.push(symbol.into());
        self
    }

    fn validate(&self, archive: &str) -> Result<()> {
        for (symbol, implementation) in &self.exports {
            if symbol.is_empty() || implementation.is_empty() {
                return Err(Error::invalid_image(
                    archive,
                    format!("empty export binding {symbol:?} -> {implementation:?}"),
                ));
            }
        }
        if self.imports.iter().any(String::is_empty) {
            return Err(Error::invalid_image(archive, "empty import"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub archive: String,
    pub manifest: Manifest,
}

impl Image {
    /// Parse the manifest out of a seekable archive.
    ///
    /// # Errors
    /// Returns [`Error::InvalidImage`] if the archive is not a zip file, has no
    /// manifest, or the manifest is malformed.
    pub fn decode(archive: &str, reader: impl Read + Seek) -> Result<Self> {
        let mut zip = zip::ZipArchive::new(reader).map_err(|e| Error::invalid_image(archive, e))?;
        let manifest: Manifest = {
            let entry = zip
                .by_name(MANIFEST)
                .map_err(|e| Error::invalid_image(archive, format!("{MANIFEST}: {e}")))?;
            serde_json::from_reader(entry)
                .map_err(|e| Error::invalid_image(archive, format!("{MANIFEST}: {e}")))?
        };
        manifest.validate(archive)?;
        Ok(Self {
            archive: archive.to_string(),
            manifest,
        })
    }

    /// Build an archive from a manifest and resources.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the archive cannot be written.
    pub fn encode(manifest: &Manifest, resources: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| Error::Internal(e.into()))?;
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);

        writer
            .start_file(MANIFEST, options)
            .map_err(|e| Error::Internal(e.into()))?;
        writer.write_all(&json).map_err(|e| Error::Internal(e.into()))?;
        for (path, data) in resources {
            writer
                .start_file(*path, options)
                .map_err(|e| Error::Internal(e.into()))?;
            writer.write_all(data).map_err(|e| Error::Internal(e.into()))?;
        }
        let cursor = writer.finish().map_err(|e| Error::Internal(e.into()))?;
        Ok(cursor.into_inner())
    }
}

/// Non-manifest archive entries, keyed by their path inside the archive.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    entries: HashMap<String, Bytes>,
}

impl Resources {
    /// Drain a forward-only stream and collect every resource entry.
    ///
    /// # Errors
    /// Returns [`Error::InvalidImage`] if the stream cannot be read, is not a
    /// zip archive, or exceeds [`MAX_ARCHIVE_SIZE`] / [`MAX_RESOURCE_SIZE`].
    pub fn read(archive: &str, reader: impl Read) -> Result<Self> {
        Self::read_limited(archive, reader, MAX_ARCHIVE_SIZE, MAX_RESOURCE_SIZE)
    }

    fn read_limited(
        archive: &str,
        reader: impl Read,
        archive_limit: u64,
        resource_limit: u64,
    ) -> Result<Self> {
        let mut buf = Vec::new();
        reader
            .take(archive_limit.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| Error::invalid_image(archive, e))?;
        if buf.len() as u64 > archive_limit {
            return Err(Error::invalid_image(
                archive,
                format!("archive exceeds {archive_limit} bytes"),
            ));
        }

        let mut zip = zip::ZipArchive::new(io::Cursor::new(buf))
            .map_err(|e| Error::invalid_image(archive, e))?;
        let mut entries = HashMap::new();
        for index in 0..zip.len() {
            let file = zip
                .by_index(index)
                .map_err(|e| Error::invalid_image(archive, e))?;
            if file.is_dir() || file.name() == MANIFEST {
                continue;
            }
            let path = file.name().to_string();
            // Declared sizes are untrusted; grow as data actually arrives.
            let mut data = Vec::new();
            file.take(resource_limit.saturating_add(1))
                .read_to_end(&mut data)
                .map_err(|e| Error::invalid_image(archive, format!("{path}: {e}")))?;
            if data.len() as u64 > resource_limit {
                return Err(Error::invalid_image(
                    archive,
                    format!("{path}: resource exceeds {resource_limit} bytes"),
                ));
            }
            entries.insert(path, Bytes::from(data));
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.entries.get(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` in; paths already present are kept.
    pub(crate) fn extend(&mut self, other: Self) {
        for (path, data) in other.entries {
            self.entries.entry(path).or_insert(data);
        }
    }
}
