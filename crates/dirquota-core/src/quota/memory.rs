//! In-memory quota subsystem.
//!
//! Behaves like a single XFS mount with project quotas enabled: projects
//! must be set up before limits stick, and every call is recorded so tests
//! can assert on exactly what the engine did.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{EnforcementError, EnforcementResult, QuotaBackend, QuotaLimits, QuotaRecord};
use crate::registry::{ProjectId, RegistryFiles};

/// A mutating call made against [`InMemoryQuota`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCall {
    /// `setup_project(path, id)`.
    Setup {
        /// Project directory.
        path: PathBuf,
        /// Project id.
        id: ProjectId,
    },
    /// `set_limit(path, id, limits)`.
    Limit {
        /// Project directory.
        path: PathBuf,
        /// Project id.
        id: ProjectId,
        /// Limits applied.
        limits: QuotaLimits,
    },
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<PathBuf, ProjectId>,
    records: BTreeMap<PathBuf, QuotaRecord>,
    failing: BTreeSet<PathBuf>,
    calls: Vec<QuotaCall>,
    query_failure: Option<String>,
}

/// Quota subsystem held entirely in memory.
#[derive(Debug)]
pub struct InMemoryQuota {
    mountpoint: PathBuf,
    state: Mutex<State>,
}

impl InMemoryQuota {
    /// Creates an empty subsystem whose every path lives on `mountpoint`.
    #[must_use]
    pub fn new(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutating calls seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<QuotaCall> {
        self.state().calls.clone()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Current record for a path.
    #[must_use]
    pub fn record(&self, path: &Path) -> Option<QuotaRecord> {
        self.state().records.get(path).copied()
    }

    /// Live project id for a path.
    #[must_use]
    pub fn project(&self, path: &Path) -> Option<ProjectId> {
        self.state().projects.get(path).copied()
    }

    /// Sets disk usage (KiB) for a set-up project.
    pub fn set_used_kib(&self, path: &Path, used: u64) {
        if let Some(record) = self.state().records.get_mut(path) {
            record.blocks.used = used;
        }
    }

    /// Edits a record behind the engine's back.
    pub fn tamper(&self, path: &Path, edit: impl FnOnce(&mut QuotaRecord)) {
        if let Some(record) = self.state().records.get_mut(path) {
            edit(record);
        }
    }

    /// Drops the live project association for a path.
    pub fn forget_project(&self, path: &Path) {
        let mut state = self.state();
        state.projects.remove(path);
        state.records.remove(path);
    }

    /// Makes every mutating call for `path` fail.
    pub fn fail_path(&self, path: impl Into<PathBuf>) {
        self.state().failing.insert(path.into());
    }

    /// Makes state queries fail (or succeed again with `None`).
    pub fn fail_queries(&self, reason: Option<&str>) {
        self.state().query_failure = reason.map(str::to_string);
    }

    fn check(&self, state: &State, path: &Path, op: &str) -> EnforcementResult<()> {
        if state.failing.contains(path) {
            return Err(EnforcementError::CommandFailed {
                command: format!("{op} {}", path.display()),
                status: "exit status: 1".to_string(),
                stderr: format!("injected failure on {}", self.mountpoint.display()),
            });
        }
        Ok(())
    }

    fn check_query(state: &State) -> EnforcementResult<()> {
        match &state.query_failure {
            Some(reason) => Err(EnforcementError::CommandFailed {
                command: "report".to_string(),
                status: "exit status: 1".to_string(),
                stderr: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl QuotaBackend for InMemoryQuota {
    fn applied_quotas(
        &self,
        _files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, QuotaRecord>> {
        let state = self.state();
        Self::check_query(&state)?;
        Ok(state.records.clone())
    }

    fn applied_projects(
        &self,
        _files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, ProjectId>> {
        let state = self.state();
        Self::check_query(&state)?;
        Ok(state.projects.clone())
    }

    fn mountpoint_for(&self, path: &Path) -> EnforcementResult<PathBuf> {
        if path.starts_with(&self.mountpoint) {
            Ok(self.mountpoint.clone())
        } else {
            Err(EnforcementError::Mountpoint {
                path: path.display().to_string(),
                reason: format!("not under {}", self.mountpoint.display()),
            })
        }
    }

    fn setup_project(
        &self,
        _files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        _mountpoint: &Path,
    ) -> EnforcementResult<()> {
        let mut state = self.state();
        self.check(&state, path, "project -s")?;
        state.calls.push(QuotaCall::Setup {
            path: path.to_path_buf(),
            id,
        });
        state.projects.insert(path.to_path_buf(), id);
        state.records.entry(path.to_path_buf()).or_default();
        Ok(())
    }

    fn set_limit(
        &self,
        _files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        _mountpoint: &Path,
        limits: &QuotaLimits,
    ) -> EnforcementResult<()> {
        let mut state = self.state();
        self.check(&state, path, "limit")?;
        state.calls.push(QuotaCall::Limit {
            path: path.to_path_buf(),
            id,
            limits: *limits,
        });
        if state.projects.get(path) != Some(&id) {
            // Limits on an unknown project land on the id but not the
            // directory; mirror that by not recording anything.
            return Ok(());
        }
        let record = state.records.entry(path.to_path_buf()).or_default();
        record.blocks.soft = limits.block_soft_kib;
        record.blocks.hard = limits.block_hard_kib;
        record.inodes.soft = limits.inode_soft;
        record.inodes.hard = limits.inode_hard;
        record.realtime.soft = limits.rt_soft_kib;
        record.realtime.hard = limits.rt_hard_kib;
        Ok(())
    }
}
