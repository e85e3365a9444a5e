//! Project id registry.
//!
//! The registry is a pair of mirrored text files that XFS tooling reads to
//! translate between directories and numeric project ids:
//!
//! ```text
//! /etc/projid     <path>:<id>     (forward)
//! /etc/projects   <id>:<path>     (reverse)
//! ```
//!
//! Both files are rendered from the same in-memory [`ProjectMap`], start with
//! [`OWNERSHIP_PREAMBLE`], and are replaced atomically so readers never see a
//! half-written file.
//!
//! # Invariants
//!
//! - Within a map, no two paths share an id and no path appears twice.
//! - After [`ProjectRegistry::reconcile`] the map holds exactly the current
//!   directory set.
//! - New ids are `max(loaded ids ∪ {min_projid - 1}) + 1`, evaluated against
//!   the map as loaded, so an id vacated in the same pass is never reused.
//! - No id exceeds [`MAX_PROJID`]. Paths that would need a larger id are
//!   reported in [`Reconciled::unassigned`] and left out of the map.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Header written at the top of both registry files.
pub const OWNERSHIP_PREAMBLE: &str = "\
# DO NOT EDIT MANUALLY: this file is managed by dirquota-daemon.
# Entries are added and removed automatically as home directories come and go.
";

/// A project id.
pub type ProjectId = u32;

/// Highest usable project id. XFS reserves `2^32 - 1`.
pub const MAX_PROJID: ProjectId = u32::MAX - 1;

/// Registry errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A registry line could not be parsed.
    #[error("malformed registry line {file}:{line}: {reason}")]
    Parse {
        /// File containing the line.
        file: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Reading or writing a registry file failed.
    #[error("registry I/O failed for '{file}': {source}")]
    Io {
        /// File being accessed.
        file: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    fn io(file: &Path, source: io::Error) -> Self {
        Self::Io {
            file: file.display().to_string(),
            source,
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    /// Directory path.
    pub path: PathBuf,
    /// Project id bound to the path.
    pub id: ProjectId,
}

/// Ordered path → id mapping.
///
/// Iteration follows insertion order, which is what gets written to disk;
/// identical inputs therefore produce byte-identical files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectMap {
    entries: Vec<ProjectEntry>,
}

impl ProjectMap {
    /// Creates an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry.
    ///
    /// Returns `false` (leaving the map unchanged) if the path or id is
    /// already present.
    pub fn insert(&mut self, path: PathBuf, id: ProjectId) -> bool {
        if self.entries.iter().any(|e| e.path == path || e.id == id) {
            return false;
        }
        self.entries.push(ProjectEntry { path, id });
        true
    }

    /// Looks up the id for a path.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<ProjectId> {
        self.entries.iter().find(|e| e.path == path).map(|e| e.id)
    }

    /// Looks up the path for an id.
    #[must_use]
    pub fn path_of(&self, id: ProjectId) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.path.as_path())
    }

    /// Whether the map contains a path.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ProjectEntry> {
        self.entries.iter()
    }

    /// Highest id in the map.
    #[must_use]
    pub fn max_id(&self) -> Option<ProjectId> {
        self.entries.iter().map(|e| e.id).max()
    }

    /// Forward file contents (`path:id`).
    #[must_use]
    pub fn render_projid(&self) -> String {
        let mut out = String::from(OWNERSHIP_PREAMBLE);
        for entry in &self.entries {
            let _ = writeln!(out, "{}:{}", entry.path.display(), entry.id);
        }
        out
    }

    /// Reverse file contents (`id:path`).
    #[must_use]
    pub fn render_projects(&self) -> String {
        let mut out = String::from(OWNERSHIP_PREAMBLE);
        for entry in &self.entries {
            let _ = writeln!(out, "{}:{}", entry.id, entry.path.display());
        }
        out
    }
}

impl<'a> IntoIterator for &'a ProjectMap {
    type Item = &'a ProjectEntry;
    type IntoIter = std::slice::Iter<'a, ProjectEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Location of the two registry files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryFiles {
    /// Reverse file (`id:path`), e.g. `/etc/projects`.
    pub projects_file: PathBuf,
    /// Forward file (`path:id`), e.g. `/etc/projid`.
    pub projid_file: PathBuf,
}

/// Outcome of [`ProjectRegistry::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The updated map.
    pub map: ProjectMap,
    /// Whether `map` differs from the map that was passed in.
    pub changed: bool,
    /// Paths that received a new id.
    pub added: Vec<PathBuf>,
    /// Paths that were dropped.
    pub removed: Vec<PathBuf>,
    /// Current paths left out of `map` because the id space is exhausted.
    pub unassigned: Vec<PathBuf>,
}

/// Reads, reconciles and writes the registry files.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    files: RegistryFiles,
}

impl ProjectRegistry {
    /// Creates a registry over the given files.
    #[must_use]
    pub const fn new(files: RegistryFiles) -> Self {
        Self { files }
    }

    /// The files this registry manages.
    #[must_use]
    pub const fn files(&self) -> &RegistryFiles {
        &self.files
    }

    /// Parses both registry files and returns the forward mapping.
    ///
    /// A missing file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Parse` for any malformed line in either file
    /// and `RegistryError::Io` if a file exists but cannot be read.
    pub fn load(&self) -> RegistryResult<ProjectMap> {
        let forward = match read_optional(&self.files.projid_file)? {
            Some(text) => parse_projid(&text, &self.files.projid_file)?,
            None => ProjectMap::new(),
        };
        if let Some(text) = read_optional(&self.files.projects_file)? {
            parse_projects(&text, &self.files.projects_file)?;
        }
        Ok(forward)
    }

    /// Parses only the reverse file (`id:path`).
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`].
    pub fn load_reverse(&self) -> RegistryResult<ProjectMap> {
        match read_optional(&self.files.projects_file)? {
            Some(text) => parse_projects(&text, &self.files.projects_file),
            None => Ok(ProjectMap::new()),
        }
    }

    /// Computes the map for the current directory set.
    ///
    /// Entries whose path is not in `current` are dropped; paths in
    /// `current` without an entry get the next id. Survivors keep their
    /// position, new entries are appended in the order of `current`. Once
    /// the next id would pass [`MAX_PROJID`], remaining new paths go to
    /// [`Reconciled::unassigned`] instead.
    #[must_use]
    pub fn reconcile(loaded: &ProjectMap, current: &[PathBuf], min_projid: ProjectId) -> Reconciled {
        let wanted: HashSet<&Path> = current.iter().map(PathBuf::as_path).collect();
        let mut next_id = loaded
            .max_id()
            .unwrap_or(0)
            .max(min_projid.saturating_sub(1))
            .checked_add(1);

        let mut map = ProjectMap::new();
        let mut removed = Vec::new();
        for entry in loaded {
            if wanted.contains(entry.path.as_path()) {
                map.insert(entry.path.clone(), entry.id);
            } else {
                removed.push(entry.path.clone());
            }
        }

        let mut added = Vec::new();
        let mut unassigned = Vec::new();
        for path in current {
            if map.contains(path) {
                continue;
            }
            match next_id.filter(|id| *id <= MAX_PROJID) {
                Some(id) if map.insert(path.clone(), id) => {
                    added.push(path.clone());
                    next_id = id.checked_add(1);
                },
                _ => unassigned.push(path.clone()),
            }
        }

        Reconciled {
            changed: !added.is_empty() || !removed.is_empty(),
            map,
            added,
            removed,
            unassigned,
        }
    }

    /// Whether both files on disk already hold exactly the rendering of
    /// `map`.
    #[must_use]
    pub fn matches_disk(&self, map: &ProjectMap) -> bool {
        let same = |path: &Path, expected: String| {
            fs::read(path).is_ok_and(|bytes| bytes == expected.into_bytes())
        };
        same(&self.files.projid_file, map.render_projid())
            && same(&self.files.projects_file, map.render_projects())
    }

    /// Writes both files.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if either file cannot be replaced.
    pub fn persist(&self, map: &ProjectMap) -> RegistryResult<()> {
        atomic_write(&self.files.projid_file, map.render_projid().as_bytes())?;
        atomic_write(&self.files.projects_file, map.render_projects().as_bytes())?;
        debug!(
            projid = %self.files.projid_file.display(),
            projects = %self.files.projects_file.display(),
            entries = map.len(),
            "registry files written"
        );
        Ok(())
    }
}

fn read_optional(path: &Path) -> RegistryResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RegistryError::io(path, e)),
    }
}

fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
}

fn parse_id(raw: &str, file: &Path, line: usize) -> RegistryResult<ProjectId> {
    raw.trim().parse().map_err(|_| RegistryError::Parse {
        file: file.display().to_string(),
        line,
        reason: format!("'{raw}' is not a valid project id"),
    })
}

fn push_unique(
    map: &mut ProjectMap,
    path: PathBuf,
    id: ProjectId,
    file: &Path,
    line: usize,
) -> RegistryResult<()> {
    if map.insert(path.clone(), id) {
        return Ok(());
    }
    Err(RegistryError::Parse {
        file: file.display().to_string(),
        line,
        reason: format!("duplicate entry for '{}' or id {id}", path.display()),
    })
}

/// Parses `path:id` lines, splitting at the last colon.
fn parse_projid(text: &str, file: &Path) -> RegistryResult<ProjectMap> {
    let mut map = ProjectMap::new();
    for (line, content) in data_lines(text) {
        let (path, id) = content.rsplit_once(':').ok_or_else(|| RegistryError::Parse {
            file: file.display().to_string(),
            line,
            reason: "expected '<path>:<id>'".to_string(),
        })?;
        let id = parse_id(id, file, line)?;
        push_unique(&mut map, PathBuf::from(path), id, file, line)?;
    }
    Ok(map)
}

/// Parses `id:path` lines, splitting at the first colon.
fn parse_projects(text: &str, file: &Path) -> RegistryResult<ProjectMap> {
    let mut map = ProjectMap::new();
    for (line, content) in data_lines(text) {
        let (id, path) = content.split_once(':').ok_or_else(|| RegistryError::Parse {
            file: file.display().to_string(),
            line,
            reason: "expected '<id>:<path>'".to_string(),
        })?;
        let id = parse_id(id, file, line)?;
        push_unique(&mut map, PathBuf::from(path), id, file, line)?;
    }
    Ok(map)
}

/// Atomic write: write to temp file in the target directory then rename.
fn atomic_write(target: &Path, data: &[u8]) -> RegistryResult<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| RegistryError::io(target, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| RegistryError::io(target, e))?;
    }

    temp.as_file_mut()
        .write_all(data)
        .map_err(|e| RegistryError::io(target, e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| RegistryError::io(target, e))?;
    temp.persist(target)
        .map_err(|e| RegistryError::io(target, e.error))?;
    Ok(())
}
