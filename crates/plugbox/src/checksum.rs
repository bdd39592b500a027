use std::{fmt::Write as _, path::Path};

use sha2::{Digest, Sha256};

use crate::code::CodeHandle;

/// Suffix of the checksum sidecar that accompanies an archive.
pub const CHECKSUM_SUFFIX: &str = ".md5";

const COMBINED_SEPARATOR: &str = ",";

/// Sidecar file name for an archive: `foo.img` -> `foo.md5`, `foo` -> `foo.md5`.
#[must_use]
pub fn sidecar_name(archive_name: &str) -> String {
    let stem = Path::new(archive_name)
        .file_stem()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or(archive_name);
    format!("{stem}{CHECKSUM_SUFFIX}")
}

/// Sidecar file name inside the cache root: `foo.img` -> `foo.img.md5`.
///
/// Keyed on the full name so `foo.img` and `foo.zip` never share metadata.
#[must_use]
pub fn cache_sidecar_name(archive_name: &str) -> String {
    format!("{archive_name}{CHECKSUM_SUFFIX}")
}

/// Hex SHA-256 digest, the token `plugbox pack` writes into sidecars.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Cache key for prepared state spanning every archive of a task.
///
/// Returns `None` as soon as one checksum is unknown: the executor then has to
/// rebuild from scratch instead of reusing anything keyed on this value.
#[must_use]
pub fn combined_checksum(code: &[CodeHandle]) -> Option<String> {
    combine(code.iter().map(CodeHandle::checksum))
}

pub(crate) fn combine<'a>(checksums: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut parts = Vec::new();
    for checksum in checksums {
        if checksum.is_empty() {
            return None;
        }
        parts.push(checksum);
    }
    parts.sort_unstable();
    Some(parts.join(COMBINED_SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_replaces_extension() {
        assert_eq!(sidecar_name("plugin.img"), "plugin.md5");
        assert_eq!(sidecar_name("plugin"), "plugin.md5");
        assert_eq!(sidecar_name("a.b.zip"), "a.b.md5");
    }

    #[test]
    fn cache_sidecar_keeps_extension() {
        assert_eq!(cache_sidecar_name("plugin.img"), "plugin.img.md5");
        assert_ne!(cache_sidecar_name("plugin.img"), cache_sidecar_name("plugin.zip"));
    }

    #[test]
    fn combined_is_undefined_with_unknown_part() {
        assert_eq!(combine(["abc", ""]), None);
        assert_eq!(combine(["", "abc"]), None);
    }

    #[test]
    fn combined_is_order_independent() {
        assert_eq!(combine(["b", "a"]), Some("a,b".to_string()));
        assert_eq!(combine(["a", "b"]), combine(["b", "a"]));
    }

    #[test]
    fn combined_of_nothing_is_empty_but_defined() {
        assert_eq!(combine([]), Some(String::new()));
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
