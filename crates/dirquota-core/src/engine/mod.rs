//! Reconciliation engine.
//!
//! One call to [`Engine::reconcile_step`] runs a full cycle:
//!
//! 1. **Discover** immediate subdirectories of every configured root.
//! 2. **Sync the registry**: purge vanished paths, assign ids to new ones,
//!    and rewrite both files when the mapping changed, the engine is dirty,
//!    or the files on disk no longer match the mapping.
//! 3. **Enforce**: for every registered path whose live project association
//!    is missing or whose live limits differ from the desired limits, set up
//!    the project and apply the full desired limit set.
//! 4. **Publish** the applied quota state to metrics.
//!
//! # Failure handling
//!
//! - A root that fails discovery is skipped for the cycle and its existing
//!   registry entries are kept untouched (neither purged nor enforced).
//! - A registry parse or write failure aborts the cycle before any
//!   enforcement, as does a failure to query live quota state.
//! - A directory that cannot get a project id because the id space is
//!   exhausted is recorded as a failure and left out of the registry.
//! - A per-path enforcement failure is logged and recorded in the
//!   [`CycleReport`]; the remaining paths are still processed. The next
//!   cycle recomputes everything from scratch and retries.
//!
//! Quotas on directories that left the registry are never touched.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::QuotaConfig;
use crate::discovery::{DirectoryDiscoverer, DiscoveryResult, RootScan};
use crate::metrics::{CycleOutcome, QuotaMetrics};
use crate::quota::{EnforcementError, QuotaBackend, QuotaLimits, QuotaRecord};
use crate::registry::{MAX_PROJID, ProjectId, ProjectMap, ProjectRegistry, RegistryError};

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The registry could not be loaded or written.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Live quota state could not be queried.
    #[error("quota query failed: {0}")]
    Query(#[from] EnforcementError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// ─────────────────────────────────────────────────────────────────────────────
// Cycle report
// ─────────────────────────────────────────────────────────────────────────────

/// Enforcement step that failed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Allocating a project id.
    AssignProjectId,
    /// Resolving the containing mountpoint.
    ResolveMountpoint,
    /// Registering the directory as a project.
    SetupProject,
    /// Applying limits.
    SetLimit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AssignProjectId => "assign project id",
            Self::ResolveMountpoint => "resolve mountpoint",
            Self::SetupProject => "setup project",
            Self::SetLimit => "set limit",
        })
    }
}

/// A per-path enforcement failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    /// Directory being enforced.
    pub path: PathBuf,
    /// Step that failed.
    pub operation: Operation,
    /// Rendered error.
    pub error: String,
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Directories discovered across all healthy roots.
    pub discovered: usize,
    /// Roots that failed discovery this cycle.
    pub failed_roots: Vec<PathBuf>,
    /// Paths that received a new project id.
    pub added: Vec<PathBuf>,
    /// Paths dropped from the registry.
    pub removed: Vec<PathBuf>,
    /// Whether the registry files were rewritten.
    pub registry_written: bool,
    /// Number of `setup_project` calls that succeeded.
    pub projects_set_up: usize,
    /// Number of `set_limit` calls that succeeded.
    pub limits_applied: usize,
    /// Enforcement failures.
    pub failures: Vec<PathFailure>,
}

impl CycleReport {
    /// Whether every root was scanned and every path enforced.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_roots.is_empty() && self.failures.is_empty()
    }

    /// Outcome label for this cycle.
    #[must_use]
    pub fn outcome(&self) -> CycleOutcome {
        if self.is_clean() {
            CycleOutcome::Ok
        } else {
            CycleOutcome::Partial
        }
    }

    fn fail(&mut self, path: &Path, operation: Operation, e: &EnforcementError) {
        warn!(path = %path.display(), %operation, error = %e, "quota enforcement failed");
        self.failures.push(PathFailure {
            path: path.to_path_buf(),
            operation,
            error: e.to_string(),
        });
    }

    fn unassigned(&mut self, path: &Path) {
        error!(
            path = %path.display(),
            max_projid = MAX_PROJID,
            "project id space exhausted, directory left unregistered"
        );
        self.failures.push(PathFailure {
            path: path.to_path_buf(),
            operation: Operation::AssignProjectId,
            error: format!("project ids exhausted (max {MAX_PROJID})"),
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Drives discovery, registry sync and enforcement against a
/// [`QuotaBackend`].
pub struct Engine<B> {
    config: QuotaConfig,
    registry: ProjectRegistry,
    discoverer: DirectoryDiscoverer,
    backend: B,
    metrics: Option<QuotaMetrics>,
    dirty: bool,
}

impl<B: QuotaBackend> Engine<B> {
    /// Creates an engine. Nothing is applied until the first
    /// [`Self::reconcile_step`].
    #[must_use]
    pub fn new(config: QuotaConfig, backend: B) -> Self {
        let registry = ProjectRegistry::new(config.registry_files());
        let discoverer = DirectoryDiscoverer::new(config.root_owner_uid, config.root_owner_gid);
        Self {
            config,
            registry,
            discoverer,
            backend,
            metrics: None,
            dirty: false,
        }
    }

    /// Publishes applied quota state to `metrics` after each cycle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: QuotaMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// The quota backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the next cycle will rewrite the registry and re-apply every
    /// quota.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Forces the next cycle to rewrite the registry and re-apply every
    /// quota regardless of live state.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Replaces the configuration between cycles.
    ///
    /// Changing the id floor or either registry file marks the engine
    /// dirty.
    pub fn update_config(&mut self, config: QuotaConfig) {
        if config.min_projid != self.config.min_projid
            || config.registry_files() != *self.registry.files()
        {
            debug!("id floor or registry files changed, marking engine dirty");
            self.dirty = true;
        }
        self.registry = ProjectRegistry::new(config.registry_files());
        self.discoverer = DirectoryDiscoverer::new(config.root_owner_uid, config.root_owner_gid);
        self.config = config;
    }

    /// Runs one reconciliation cycle.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Registry` if the registry cannot be loaded or
    /// written and `EngineError::Query` if live quota state cannot be
    /// read. Per-path enforcement failures do not abort the cycle; they are
    /// reported in [`CycleReport::failures`].
    pub fn reconcile_step(&mut self) -> EngineResult<CycleReport> {
        let result = self.run_cycle();
        let outcome = match &result {
            Ok(report) => report.outcome(),
            Err(e) => {
                error!(error = %e, "reconciliation cycle failed");
                CycleOutcome::Failed
            },
        };
        if let Some(metrics) = &self.metrics {
            metrics.cycle_completed(outcome);
        }
        result
    }

    fn run_cycle(&mut self) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();
        let scans = self.discoverer.scan_all(&self.config.paths);
        let loaded = self.registry.load()?;

        let (current, retained) = collect_directories(scans, &loaded, &mut report);
        let reconciled = ProjectRegistry::reconcile(&loaded, &current, self.config.min_projid);
        for path in &reconciled.added {
            info!(path = %path.display(), id = ?reconciled.map.get(path), "registering directory");
        }
        for path in &reconciled.removed {
            info!(path = %path.display(), "directory gone, dropping from registry");
        }
        for path in &reconciled.unassigned {
            report.unassigned(path);
        }

        if reconciled.changed || self.dirty || !self.registry.matches_disk(&reconciled.map) {
            self.registry.persist(&reconciled.map)?;
            report.registry_written = true;
        }
        report.added = reconciled.added;
        report.removed = reconciled.removed;

        let files = self.registry.files().clone();
        let mut applied = self.backend.applied_quotas(&files)?;
        let projects = self.backend.applied_projects(&files)?;

        for entry in &reconciled.map {
            if retained.contains(entry.path.as_path()) {
                continue;
            }
            self.enforce(&entry.path, entry.id, &applied, &projects, &mut report);
        }

        if report.projects_set_up + report.limits_applied > 0 {
            match self.backend.applied_quotas(&files) {
                Ok(fresh) => applied = fresh,
                Err(e) => warn!(error = %e, "failed to re-read quotas after enforcement"),
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.publish(&applied);
        }

        if report.failures.is_empty() {
            self.dirty = false;
        }

        info!(
            discovered = report.discovered,
            registry_written = report.registry_written,
            added = report.added.len(),
            removed = report.removed.len(),
            projects_set_up = report.projects_set_up,
            limits_applied = report.limits_applied,
            failures = report.failures.len(),
            failed_roots = report.failed_roots.len(),
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    fn enforce(
        &self,
        path: &Path,
        id: ProjectId,
        applied: &BTreeMap<PathBuf, QuotaRecord>,
        projects: &BTreeMap<PathBuf, ProjectId>,
        report: &mut CycleReport,
    ) {
        let desired = QuotaLimits::hard_block_limit(self.config.hard_limit_bytes_for(path));
        let needs_setup = self.dirty || projects.get(path) != Some(&id);
        let needs_limit =
            needs_setup || applied.get(path).map(QuotaRecord::limits) != Some(desired);
        if !needs_limit {
            return;
        }

        let mountpoint = match self.backend.mountpoint_for(path) {
            Ok(mountpoint) => mountpoint,
            Err(e) => return report.fail(path, Operation::ResolveMountpoint, &e),
        };
        let files = self.registry.files();

        if needs_setup {
            if let Err(e) = self.backend.setup_project(files, path, id, &mountpoint) {
                return report.fail(path, Operation::SetupProject, &e);
            }
            report.projects_set_up += 1;
        }

        match self.backend.set_limit(files, path, id, &mountpoint, &desired) {
            Ok(()) => {
                debug!(
                    path = %path.display(),
                    id,
                    hard_kib = desired.block_hard_kib,
                    "applied quota"
                );
                report.limits_applied += 1;
            },
            Err(e) => report.fail(path, Operation::SetLimit, &e),
        }
    }
}

/// Builds the ordered directory list for this cycle.
///
/// Returns the list and the subset carried over from roots that failed
/// discovery.
fn collect_directories(
    scans: Vec<(PathBuf, DiscoveryResult<RootScan>)>,
    loaded: &ProjectMap,
    report: &mut CycleReport,
) -> (Vec<PathBuf>, HashSet<PathBuf>) {
    let mut current = Vec::new();
    let mut retained = HashSet::new();
    for (root, result) in scans {
        match result {
            Ok(scan) => {
                report.discovered += scan.directories.len();
                current.extend(scan.directories);
            },
            Err(e) => {
                error!(root = %root.display(), error = %e, "failed to discover directories");
                for entry in loaded {
                    if entry.path.parent() == Some(root.as_path()) {
                        current.push(entry.path.clone());
                        retained.insert(entry.path.clone());
                    }
                }
                report.failed_roots.push(root);
            },
        }
    }
    (current, retained)
}

impl<B> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
