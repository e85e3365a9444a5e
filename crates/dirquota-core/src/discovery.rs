//! Home directory discovery.
//!
//! Lists the immediate subdirectories of each configured root. Symbolic
//! links are never followed: a symlink to a directory is not a home
//! directory, since its quota would be enforced on the link target's
//! project, not on the link.
//!
//! A root that does not exist is created (and chowned to the configured
//! owner) and contributes no directories for that pass.
//!
//! Directories whose path is not valid UTF-8 or contains a line break are
//! skipped with a warning: the registry files store one `path:id` pair per
//! line and could not read such a path back unchanged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid, chown};
use thiserror::Error;
use tracing::{info, warn};

/// Discovery errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The root exists but is not a directory.
    #[error("root path is not a directory: {path}")]
    NotADirectory {
        /// The offending root.
        path: String,
    },

    /// The root could not be created or listed.
    #[error("failed to scan root '{path}': {source}")]
    Io {
        /// The root being scanned.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl DiscoveryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Directories found under a single root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootScan {
    /// The root that was scanned.
    pub root: PathBuf,
    /// Whether the root had to be created.
    pub created: bool,
    /// Immediate subdirectories, sorted by path.
    pub directories: Vec<PathBuf>,
}

/// Scans configured roots for home directories.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryDiscoverer {
    owner_uid: u32,
    owner_gid: u32,
}

impl DirectoryDiscoverer {
    /// Creates a discoverer that chowns newly created roots to
    /// `owner_uid:owner_gid`.
    #[must_use]
    pub const fn new(owner_uid: u32, owner_gid: u32) -> Self {
        Self {
            owner_uid,
            owner_gid,
        }
    }

    /// Scans every root, returning one result per root in input order.
    #[must_use]
    pub fn scan_all(&self, roots: &[PathBuf]) -> Vec<(PathBuf, DiscoveryResult<RootScan>)> {
        roots
            .iter()
            .map(|root| (root.clone(), self.scan(root)))
            .collect()
    }

    /// Scans a single root.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NotADirectory` if `root` exists but is not
    /// a directory, and `DiscoveryError::Io` if it cannot be created or
    /// read.
    pub fn scan(&self, root: &Path) -> DiscoveryResult<RootScan> {
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {},
            Ok(_) => {
                return Err(DiscoveryError::NotADirectory {
                    path: root.display().to_string(),
                });
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create_root(root)?;
                return Ok(RootScan {
                    root: root.to_path_buf(),
                    created: true,
                    directories: Vec::new(),
                });
            },
            Err(e) => return Err(DiscoveryError::io(root, e)),
        }

        let mut directories = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| DiscoveryError::io(root, e))? {
            let entry = entry.map_err(|e| DiscoveryError::io(root, e))?;
            // `DirEntry::file_type` does not traverse symlinks.
            let file_type = entry.file_type().map_err(|e| DiscoveryError::io(root, e))?;
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            if is_registrable(&path) {
                directories.push(path);
            } else {
                warn!(path = ?path, "skipping directory whose name cannot be stored in the registry");
            }
        }
        directories.sort();

        Ok(RootScan {
            root: root.to_path_buf(),
            created: false,
            directories,
        })
    }

    fn create_root(&self, root: &Path) -> DiscoveryResult<()> {
        fs::create_dir_all(root).map_err(|e| DiscoveryError::io(root, e))?;
        info!(root = %root.display(), "created missing root path");
        if let Err(e) = chown(
            root,
            Some(Uid::from_raw(self.owner_uid)),
            Some(Gid::from_raw(self.owner_gid)),
        ) {
            warn!(
                root = %root.display(),
                uid = self.owner_uid,
                gid = self.owner_gid,
                error = %e,
                "failed to set ownership of created root"
            );
        }
        Ok(())
    }
}

/// Whether `path` survives a round trip through a registry line.
fn is_registrable(path: &Path) -> bool {
    path.to_str().is_some_and(|s| !s.contains(['\n', '\r']))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discoverer() -> DirectoryDiscoverer {
        DirectoryDiscoverer::new(1000, 1000)
    }

    #[test]
    fn lists_only_immediate_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bob")).unwrap();
        fs::create_dir(dir.path().join("alice")).unwrap();
        fs::create_dir_all(dir.path().join("alice").join("nested")).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let scan = discoverer().scan(dir.path()).unwrap();
        assert!(!scan.created);
        assert_eq!(
            scan.directories,
            vec![dir.path().join("alice"), dir.path().join("bob")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(target.path(), dir.path().join("link")).unwrap();

        let scan = discoverer().scan(dir.path()).unwrap();
        assert_eq!(scan.directories, vec![dir.path().join("real")]);
    }

    #[test]
    fn names_with_line_breaks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("alice")).unwrap();
        fs::create_dir(dir.path().join("evil\nname")).unwrap();
        fs::create_dir(dir.path().join("cr\rname")).unwrap();

        let scan = discoverer().scan(dir.path()).unwrap();
        assert_eq!(scan.directories, vec![dir.path().join("alice")]);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("alice")).unwrap();
        fs::create_dir(dir.path().join(OsStr::from_bytes(b"bad\xffname"))).unwrap();

        let scan = discoverer().scan(dir.path()).unwrap();
        assert_eq!(scan.directories, vec![dir.path().join("alice")]);
    }

    #[test]
    fn missing_root_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("homes").join("nested");

        let scan = discoverer().scan(&root).unwrap();
        assert!(scan.created);
        assert!(scan.directories.is_empty());
        assert!(root.is_dir());

        let again = discoverer().scan(&root).unwrap();
        assert!(!again.created);
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            discoverer().scan(&file),
            Err(DiscoveryError::NotADirectory { .. })
        ));
    }

    #[test]
    fn scan_all_keeps_root_order_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        fs::create_dir(&good).unwrap();
        fs::create_dir(good.join("a")).unwrap();
        fs::write(&bad, b"x").unwrap();

        let results = discoverer().scan_all(&[bad.clone(), good.clone()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, bad);
        assert!(results[0].1.is_err());
        assert_eq!(results[1].1.as_ref().unwrap().directories, vec![good.join("a")]);
    }
}
