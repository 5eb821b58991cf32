//! Trust bundle: the shared keystore every node uses for transport TLS.
//!
//! The bundle is opaque to this crate. What matters:
//! - It is never empty
//! - It has a single protocol-agreed file name (no path components)
//! - It is bit-identical on every node, which operators can confirm by
//!   comparing fingerprints

pub mod generator;

pub use generator::{BuiltinGenerator, BundleGenerator, CertutilGenerator, GenerationError};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default bundle file name, matching what the search engine expects in its
/// configuration directory.
pub const DEFAULT_BUNDLE_FILE_NAME: &str = "elastic-certificates.p12";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("trust bundle '{0}' is empty")]
    Empty(String),

    #[error("invalid bundle file name '{0}': must be a plain file name")]
    InvalidName(String),

    #[error("failed to read bundle '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write bundle '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The shared certificate/keystore artifact.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustBundle {
    file_name: String,
    content: Bytes,
}

// Content is a secret; keep it out of Debug output.
impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundle")
            .field("file_name", &self.file_name)
            .field("len", &self.content.len())
            .finish()
    }
}

impl TrustBundle {
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Result<Self, BundleError> {
        let file_name = file_name.into();
        validate_file_name(&file_name)?;

        let content = content.into();
        if content.is_empty() {
            return Err(BundleError::Empty(file_name));
        }

        Ok(Self { file_name, content })
    }

    /// Load a bundle from disk, taking its file name from the path.
    pub fn read(path: &Path) -> Result<Self, BundleError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| BundleError::InvalidName(path.display().to_string()))?
            .to_string();

        let content = std::fs::read(path).map_err(|source| BundleError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::new(file_name, content)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Always false: construction rejects empty content.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Lowercase hex SHA-256 of the content.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.content))
    }

    /// Write the bundle into `dir` under its file name.
    ///
    /// The content goes to a temporary file in the same directory first and
    /// is renamed into place after an fsync, so readers only ever see the
    /// complete file.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, BundleError> {
        let dest = dir.join(&self.file_name);
        let write_err = |source| BundleError::Write {
            path: dest.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".trustseed-")
            .tempfile_in(dir)
            .map_err(write_err)?;
        tmp.write_all(&self.content).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&dest).map_err(|e| write_err(e.error))?;

        Ok(dest)
    }
}

/// Reject anything that is not a plain file name.
///
/// The name becomes both a URL path segment and a file in the served
/// directory, so separators and parent references are refused outright.
pub fn validate_file_name(name: &str) -> Result<(), BundleError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with('.');

    if invalid {
        return Err(BundleError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_bundle_rejected() {
        let result = TrustBundle::new("bundle.p12", Vec::new());
        assert!(matches!(result, Err(BundleError::Empty(_))));
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", ".", "..", "../etc/passwd", "a/b.p12", "a\\b.p12", ".hidden"] {
            assert!(
                matches!(
                    TrustBundle::new(name, vec![1u8]),
                    Err(BundleError::InvalidName(_))
                ),
                "name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = TrustBundle::new("bundle.p12", b"keystore".to_vec()).unwrap();
        let b = TrustBundle::new("bundle.p12", b"keystore".to_vec()).unwrap();
        let c = TrustBundle::new("bundle.p12", b"keystore2".to_vec()).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_write_atomic_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let bundle = TrustBundle::new("bundle.p12", vec![7u8; 3 * 1024]).unwrap();

        let path = bundle.write_atomic(temp_dir.path()).unwrap();
        assert_eq!(path, temp_dir.path().join("bundle.p12"));

        let loaded = TrustBundle::read(&path).unwrap();
        assert_eq!(loaded, bundle);

        // Only the final file remains; no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_read_empty_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bundle.p12");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(TrustBundle::read(&path), Err(BundleError::Empty(_))));
    }

    #[test]
    fn test_debug_hides_content() {
        let bundle = TrustBundle::new("bundle.p12", b"secret-material".to_vec()).unwrap();
        let debug = format!("{:?}", bundle);
        assert!(debug.contains("bundle.p12"));
        assert!(!debug.contains("secret"));
    }
}
