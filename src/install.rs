//! Bundle installation into the node's configuration directory.
//!
//! The installed file is owned by the search engine's service account and
//! has mode 0640: the bundle holds a private key shared by the whole
//! cluster, so there is no world access.
//!
//! Installing is idempotent. When the destination already holds the same
//! bytes with the right owner and mode nothing is touched; when only the
//! metadata drifted it is repaired in place.

use crate::bundle::{BundleError, TrustBundle};
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uzers::{get_current_gid, get_current_uid, get_group_by_gid, get_group_by_name, get_user_by_name, get_user_by_uid};

/// Owner read/write, group read, nothing for others.
pub const BUNDLE_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("refusing to install empty trust bundle from '{0}'")]
    EmptyBundle(PathBuf),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("invalid install destination '{0}'")]
    InvalidDestination(PathBuf),

    #[error("failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not set ownership to {owner} on '{path}': {source}")]
    Chown {
        path: PathBuf,
        owner: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not set mode {mode:o} on '{path}': {source}")]
    Chmod {
        path: PathBuf,
        mode: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bundle(BundleError),
}

/// Account that owns the installed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Resolve a user and group by name.
    pub fn lookup(user: &str, group: &str) -> Result<Self, InstallError> {
        let uid = get_user_by_name(user)
            .ok_or_else(|| InstallError::UnknownUser(user.to_string()))?
            .uid();
        let gid = get_group_by_name(group)
            .ok_or_else(|| InstallError::UnknownGroup(group.to_string()))?
            .gid();

        Ok(Self {
            user: user.to_string(),
            group: group.to_string(),
            uid,
            gid,
        })
    }

    /// The account running this process.
    pub fn current() -> Self {
        let uid = get_current_uid();
        let gid = get_current_gid();
        let user = get_user_by_uid(uid)
            .map(|u| u.name().to_string_lossy().to_string())
            .unwrap_or_else(|| uid.to_string());
        let group = get_group_by_gid(gid)
            .map(|g| g.name().to_string_lossy().to_string())
            .unwrap_or_else(|| gid.to_string());

        Self {
            user,
            group,
            uid,
            gid,
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user, self.group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// New or changed content was written.
    Installed,
    /// Content was already correct; ownership or mode was fixed.
    Repaired,
    /// Nothing to do.
    AlreadyCurrent,
}

#[derive(Debug, Clone)]
pub struct BundleInstaller {
    owner: Owner,
    mode: u32,
}

impl BundleInstaller {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            mode: BUNDLE_MODE,
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Install the bundle at `dest`.
    pub fn install(&self, bundle: &TrustBundle, dest: &Path) -> Result<InstallOutcome, InstallError> {
        if bundle.is_empty() {
            return Err(InstallError::EmptyBundle(dest.to_path_buf()));
        }

        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && dest.file_name().is_some() => dir,
            _ => return Err(InstallError::InvalidDestination(dest.to_path_buf())),
        };
        fs::create_dir_all(dir).map_err(|source| InstallError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        match fs::read(dest) {
            Ok(existing) if existing.as_slice() == bundle.content().as_ref() => {
                if self.metadata_matches(dest)? {
                    info!(path = %dest.display(), "trust bundle already installed");
                    return Ok(InstallOutcome::AlreadyCurrent);
                }
                self.apply_ownership(dest)?;
                info!(path = %dest.display(), owner = %self.owner, "repaired trust bundle ownership and mode");
                return Ok(InstallOutcome::Repaired);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(InstallError::Io {
                    path: dest.to_path_buf(),
                    source,
                })
            }
        }

        let io_err = |source| InstallError::Io {
            path: dest.to_path_buf(),
            source,
        };

        // Ownership and mode are set on the temp file before the rename so
        // the final path never exists with looser permissions.
        let mut tmp = tempfile::Builder::new()
            .prefix(".trustseed-")
            .tempfile_in(dir)
            .map_err(io_err)?;
        tmp.write_all(bundle.content()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        self.apply_ownership(tmp.path())?;
        tmp.persist(dest).map_err(|e| io_err(e.error))?;

        info!(
            path = %dest.display(),
            owner = %self.owner,
            mode = %format!("{:o}", self.mode),
            fingerprint = %bundle.fingerprint(),
            "trust bundle installed"
        );
        Ok(InstallOutcome::Installed)
    }

    /// Install a bundle file from disk. Zero-byte files are rejected.
    pub fn install_file(
        &self,
        source: &Path,
        dest: &Path,
    ) -> Result<(TrustBundle, InstallOutcome), InstallError> {
        let bundle = match TrustBundle::read(source) {
            Ok(bundle) => bundle,
            Err(BundleError::Empty(_)) => {
                return Err(InstallError::EmptyBundle(source.to_path_buf()))
            }
            Err(e) => return Err(InstallError::Bundle(e)),
        };

        // The installed name is the destination's, not the source's.
        let outcome = self.install(&bundle, dest)?;
        Ok((bundle, outcome))
    }

    fn metadata_matches(&self, path: &Path) -> Result<bool, InstallError> {
        let meta = fs::metadata(path).map_err(|source| InstallError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(meta.uid() == self.owner.uid
            && meta.gid() == self.owner.gid
            && meta.mode() & 0o7777 == self.mode)
    }

    fn apply_ownership(&self, path: &Path) -> Result<(), InstallError> {
        chown(path, Some(self.owner.uid), Some(self.owner.gid)).map_err(|source| {
            InstallError::Chown {
                path: path.to_path_buf(),
                owner: self.owner.to_string(),
                source,
            }
        })?;
        fs::set_permissions(path, Permissions::from_mode(self.mode)).map_err(|source| {
            InstallError::Chmod {
                path: path.to_path_buf(),
                mode: self.mode,
                source,
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn installer() -> BundleInstaller {
        BundleInstaller::new(Owner::current())
    }

    fn bundle(content: &[u8]) -> TrustBundle {
        TrustBundle::new("bundle.p12", content.to_vec()).unwrap()
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().mode() & 0o7777
    }

    #[test]
    fn test_install_sets_mode_and_owner() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("config").join("bundle.p12");

        let outcome = installer().install(&bundle(b"keystore"), &dest).unwrap();

        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(fs::read(&dest).unwrap(), b"keystore");
        assert_eq!(mode_of(&dest), 0o640);

        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(meta.uid(), get_current_uid());
        assert_eq!(meta.gid(), get_current_gid());
    }

    #[test]
    fn test_install_twice_is_a_no_op() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");
        let installer = installer();
        let bundle = bundle(b"keystore");

        installer.install(&bundle, &dest).unwrap();
        let first = fs::metadata(&dest).unwrap();

        let outcome = installer.install(&bundle, &dest).unwrap();
        let second = fs::metadata(&dest).unwrap();

        assert_eq!(outcome, InstallOutcome::AlreadyCurrent);
        assert_eq!(first.ino(), second.ino());
        assert_eq!(first.mtime(), second.mtime());
        assert_eq!(first.mtime_nsec(), second.mtime_nsec());
        assert_eq!(first.mode(), second.mode());
        assert_eq!(fs::read(&dest).unwrap(), b"keystore");
    }

    #[test]
    fn test_wrong_mode_is_repaired() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");
        fs::write(&dest, b"keystore").unwrap();
        fs::set_permissions(&dest, Permissions::from_mode(0o644)).unwrap();

        let outcome = installer().install(&bundle(b"keystore"), &dest).unwrap();

        assert_eq!(outcome, InstallOutcome::Repaired);
        assert_eq!(mode_of(&dest), 0o640);
    }

    #[test]
    fn test_changed_content_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");
        fs::write(&dest, b"old keystore").unwrap();

        let outcome = installer().install(&bundle(b"new keystore"), &dest).unwrap();

        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(fs::read(&dest).unwrap(), b"new keystore");
        assert_eq!(mode_of(&dest), 0o640);
        // No temp files left behind
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_zero_byte_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("incoming.p12");
        let dest = temp_dir.path().join("config").join("bundle.p12");
        fs::write(&source, b"").unwrap();

        let err = installer().install_file(&source, &dest).unwrap_err();

        assert!(matches!(err, InstallError::EmptyBundle(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_install_file_uses_destination_name() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("incoming.p12");
        let dest = temp_dir.path().join("config").join("elastic-certificates.p12");
        fs::write(&source, b"keystore").unwrap();

        let (bundle, outcome) = installer().install_file(&source, &dest).unwrap();

        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(bundle.content().as_ref(), b"keystore");
        assert_eq!(fs::read(&dest).unwrap(), b"keystore");
    }

    #[test]
    fn test_unknown_user() {
        let err = Owner::lookup("trustseed-no-such-user", "trustseed-no-such-group").unwrap_err();
        assert!(matches!(err, InstallError::UnknownUser(_)));
    }

    #[test]
    fn test_invalid_destination() {
        let err = installer()
            .install(&bundle(b"keystore"), Path::new("bundle.p12"))
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidDestination(_)));
    }
}
