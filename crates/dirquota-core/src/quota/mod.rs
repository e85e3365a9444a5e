//! Quota enforcement adapter.
//!
//! The engine talks to the live quota subsystem only through
//! [`QuotaBackend`]. [`xfs::XfsQuota`] drives `xfs_quota`; the in-memory
//! backend in [`memory`] stands in for it in tests.
//!
//! All block quantities are in KiB, the native unit of `xfs_quota report`.

pub mod command;
pub mod memory;
pub mod xfs;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use self::command::{CommandRunner, SystemCommandRunner};
pub use self::memory::{InMemoryQuota, QuotaCall};
pub use self::xfs::XfsQuota;
use crate::registry::{ProjectId, RegistryError, RegistryFiles};

/// Enforcement errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnforcementError {
    /// The external tool could not be started.
    #[error("failed to run '{command}': {source}")]
    Spawn {
        /// Command line that was attempted.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The external tool exited unsuccessfully.
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The external tool did not finish in time and was killed.
    #[error("'{command}' timed out after {after:?}")]
    Timeout {
        /// Command line that timed out.
        command: String,
        /// Configured timeout.
        after: Duration,
    },

    /// Quota report output could not be parsed.
    #[error("unparsable quota report line {line}: {reason}")]
    ReportParse {
        /// 1-based line number in the report.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The containing mount could not be determined.
    #[error("cannot resolve mountpoint for '{path}': {reason}")]
    Mountpoint {
        /// Path being resolved.
        path: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The path cannot be passed to the quota tool.
    #[error("unsupported path '{path}': {reason}")]
    UnsupportedPath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading the registry for id lookups failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result type for enforcement operations.
pub type EnforcementResult<T> = Result<T, EnforcementError>;

/// Used/soft/hard triple for one quota category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Current consumption.
    pub used: u64,
    /// Soft limit (0 = none).
    pub soft: u64,
    /// Hard limit (0 = none).
    pub hard: u64,
}

/// Live quota state of one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaRecord {
    /// Disk space, in KiB.
    pub blocks: Usage,
    /// File count.
    pub inodes: Usage,
    /// Realtime-device space, in KiB.
    pub realtime: Usage,
}

impl QuotaRecord {
    /// The limit fields of this record.
    #[must_use]
    pub const fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            block_soft_kib: self.blocks.soft,
            block_hard_kib: self.blocks.hard,
            inode_soft: self.inodes.soft,
            inode_hard: self.inodes.hard,
            rt_soft_kib: self.realtime.soft,
            rt_hard_kib: self.realtime.hard,
        }
    }

    /// Disk usage in bytes.
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.blocks.used.saturating_mul(1024)
    }

    /// Hard block limit in bytes.
    #[must_use]
    pub const fn hard_limit_bytes(&self) -> u64 {
        self.blocks.hard.saturating_mul(1024)
    }
}

/// Every limit the daemon controls. Applying a `QuotaLimits` overwrites all
/// six fields so out-of-band edits are undone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Block soft limit, KiB.
    pub block_soft_kib: u64,
    /// Block hard limit, KiB.
    pub block_hard_kib: u64,
    /// Inode soft limit.
    pub inode_soft: u64,
    /// Inode hard limit.
    pub inode_hard: u64,
    /// Realtime soft limit, KiB.
    pub rt_soft_kib: u64,
    /// Realtime hard limit, KiB.
    pub rt_hard_kib: u64,
}

impl QuotaLimits {
    /// Desired state for a directory: a hard block limit and nothing else.
    /// Bytes are truncated to whole KiB; zero means unlimited.
    #[must_use]
    pub const fn hard_block_limit(bytes: u64) -> Self {
        Self {
            block_soft_kib: 0,
            block_hard_kib: bytes / 1024,
            inode_soft: 0,
            inode_hard: 0,
            rt_soft_kib: 0,
            rt_hard_kib: 0,
        }
    }
}

/// Live quota subsystem as seen by the engine.
pub trait QuotaBackend: Send + Sync {
    /// Current quota records, keyed by directory path, for the projects
    /// named in `files`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subsystem cannot be queried or its output
    /// cannot be parsed.
    fn applied_quotas(
        &self,
        files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, QuotaRecord>>;

    /// Paths that currently have a live project association, with the id
    /// the subsystem knows them by.
    ///
    /// # Errors
    ///
    /// Same as [`Self::applied_quotas`].
    fn applied_projects(
        &self,
        files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, ProjectId>>;

    /// Mountpoint of the filesystem containing `path`.
    ///
    /// # Errors
    ///
    /// Returns `EnforcementError::Mountpoint` if it cannot be determined.
    fn mountpoint_for(&self, path: &Path) -> EnforcementResult<PathBuf>;

    /// Registers `path` as project `id` on `mountpoint`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails; not retried here.
    fn setup_project(
        &self,
        files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        mountpoint: &Path,
    ) -> EnforcementResult<()>;

    /// Applies `limits` to project `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails; not retried here.
    fn set_limit(
        &self,
        files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        mountpoint: &Path,
        limits: &QuotaLimits,
    ) -> EnforcementResult<()>;
}
