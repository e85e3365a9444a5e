//! Configuration parsing and management.
//!
//! This module handles parsing of the quota configuration file (TOML) and the
//! overlay of command-line values on top of it. Configuration is a plain
//! struct handed to every component that needs it; nothing reads ambient
//! global state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::{MAX_PROJID, RegistryFiles};

/// Bytes per gibibyte, the unit used for every quota in the configuration.
pub const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Top-level quota daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    /// Root paths scanned for home directories. At least one is required
    /// once the command line has been applied.
    pub paths: Vec<PathBuf>,

    /// Reverse registry file (`id:path`).
    pub projects_file: PathBuf,

    /// Forward registry file (`path:id`).
    pub projid_file: PathBuf,

    /// Lowest project id handed out when the registry is empty.
    ///
    /// The first directory registered into an empty registry gets exactly
    /// this id, so the default of 1000 starts allocation at 1000 rather
    /// than at `min_projid + 1`. Must not exceed
    /// [`MAX_PROJID`](crate::registry::MAX_PROJID).
    pub min_projid: u32,

    /// Seconds to sleep between reconciliation cycles.
    pub wait_time_secs: u64,

    /// Default hard limit, in GiB, for every directory.
    pub hard_quota_gib: f64,

    /// Directory basenames that receive no limit.
    pub exclude: Vec<String>,

    /// Owner applied to a root path the daemon had to create.
    pub root_owner_uid: u32,

    /// Group applied to a root path the daemon had to create.
    pub root_owner_gid: u32,

    /// Optional upper bound on each external tool invocation.
    pub command_timeout_secs: Option<u64>,

    /// Per-directory hard limits in GiB, keyed by basename. An override
    /// wins over both the default and the exclusion list.
    pub quota_overrides: BTreeMap<String, f64>,

    /// Metrics endpoint settings.
    pub metrics: MetricsConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            projects_file: default_projects_file(),
            projid_file: default_projid_file(),
            min_projid: DEFAULT_MIN_PROJID,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
            hard_quota_gib: DEFAULT_HARD_QUOTA_GIB,
            exclude: Vec::new(),
            root_owner_uid: DEFAULT_ROOT_OWNER,
            root_owner_gid: DEFAULT_ROOT_OWNER,
            command_timeout_secs: None,
            quota_overrides: BTreeMap::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Default project id floor.
pub const DEFAULT_MIN_PROJID: u32 = 1000;

/// Default delay between cycles.
pub const DEFAULT_WAIT_TIME_SECS: u64 = 30;

/// Default hard quota in GiB.
pub const DEFAULT_HARD_QUOTA_GIB: f64 = 10.0;

/// Default uid/gid for newly created roots.
pub const DEFAULT_ROOT_OWNER: u32 = 1000;

fn default_projects_file() -> PathBuf {
    PathBuf::from("/etc/projects")
}

fn default_projid_file() -> PathBuf {
    PathBuf::from("/etc/projid")
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether the Prometheus endpoint is served.
    pub enabled: bool,

    /// Address the endpoint binds to.
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 9100)),
        }
    }
}

/// Values supplied on the command line. `None` (or an empty list) leaves
/// the file value in place.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Root paths to scan.
    pub paths: Vec<PathBuf>,
    /// Reverse registry file.
    pub projects_file: Option<PathBuf>,
    /// Forward registry file.
    pub projid_file: Option<PathBuf>,
    /// Project id floor.
    pub min_projid: Option<u32>,
    /// Seconds between cycles.
    pub wait_time_secs: Option<u64>,
    /// Default hard quota in GiB.
    pub hard_quota_gib: Option<f64>,
    /// Excluded basenames; replaces the file list when non-empty.
    pub exclude: Vec<String>,
    /// Overrides merged into the file map, CLI entries winning per key.
    pub quota_overrides: Vec<(String, f64)>,
    /// Metrics bind address.
    pub metrics_bind: Option<SocketAddr>,
    /// Force the metrics endpoint off.
    pub no_metrics: bool,
}

impl QuotaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or names an unknown key.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Overlay command-line values, field by field.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if !overrides.paths.is_empty() {
            self.paths = overrides.paths;
        }
        if let Some(projects_file) = overrides.projects_file {
            self.projects_file = projects_file;
        }
        if let Some(projid_file) = overrides.projid_file {
            self.projid_file = projid_file;
        }
        if let Some(min_projid) = overrides.min_projid {
            self.min_projid = min_projid;
        }
        if let Some(wait) = overrides.wait_time_secs {
            self.wait_time_secs = wait;
        }
        if let Some(hard_quota) = overrides.hard_quota_gib {
            self.hard_quota_gib = hard_quota;
        }
        if !overrides.exclude.is_empty() {
            self.exclude = overrides.exclude;
        }
        for (name, gib) in overrides.quota_overrides {
            self.quota_overrides.insert(name, gib);
        }
        if let Some(bind) = overrides.metrics_bind {
            self.metrics.bind = bind;
        }
        if overrides.no_metrics {
            self.metrics.enabled = false;
        }
    }

    /// Check the configuration before the daemon starts.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.is_empty() {
            return Err(ConfigError::Validation(
                "at least one root path must be configured".to_string(),
            ));
        }
        if self.min_projid == 0 {
            return Err(ConfigError::Validation(
                "min_projid must be at least 1".to_string(),
            ));
        }
        if self.min_projid > MAX_PROJID {
            return Err(ConfigError::Validation(format!(
                "min_projid must be at most {MAX_PROJID}"
            )));
        }
        if self.wait_time_secs == 0 {
            return Err(ConfigError::Validation(
                "wait_time_secs must be at least 1".to_string(),
            ));
        }
        if self.projects_file == self.projid_file {
            return Err(ConfigError::Validation(format!(
                "projects_file and projid_file must differ (both are {})",
                self.projects_file.display()
            )));
        }
        check_gib("hard_quota_gib", self.hard_quota_gib)?;
        for (name, gib) in &self.quota_overrides {
            check_gib(&format!("quota_overrides.{name}"), *gib)?;
        }
        if self.command_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "command_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay between cycles.
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    /// The registry file pair named by this configuration.
    #[must_use]
    pub fn registry_files(&self) -> RegistryFiles {
        RegistryFiles {
            projects_file: self.projects_file.clone(),
            projid_file: self.projid_file.clone(),
        }
    }

    /// Timeout for external tool invocations, if any.
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// Desired hard limit in bytes for a directory, applying override, then
    /// exclusion, then the default.
    #[must_use]
    pub fn hard_limit_bytes_for(&self, path: &Path) -> u64 {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(gib) = self.quota_overrides.get(&name) {
            return gib_to_bytes(*gib);
        }
        if self.exclude.iter().any(|e| *e == name) {
            return 0;
        }
        gib_to_bytes(self.hard_quota_gib)
    }
}

/// Converts GiB to bytes, truncating toward zero.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)] // inputs are validated finite and non-negative; `as` saturates
pub fn gib_to_bytes(gib: f64) -> u64 {
    (gib * BYTES_PER_GIB).trunc() as u64
}

/// Parse a `name=gib` command-line override.
///
/// # Errors
///
/// Returns `ConfigError::Validation` if the value is not `name=<number>`.
pub fn parse_override(raw: &str) -> Result<(String, f64), ConfigError> {
    let (name, gib) = raw.split_once('=').ok_or_else(|| {
        ConfigError::Validation(format!("quota override '{raw}' must look like name=gib"))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::Validation(format!(
            "quota override '{raw}' has an empty directory name"
        )));
    }
    let gib: f64 = gib.trim().parse().map_err(|_| {
        ConfigError::Validation(format!("quota override '{raw}' has a non-numeric limit"))
    })?;
    check_gib(&format!("quota override {name}"), gib)?;
    Ok((name.to_string(), gib))
}

fn check_gib(field: &str, gib: f64) -> Result<(), ConfigError> {
    if !gib.is_finite() || gib < 0.0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be a finite, non-negative number of GiB (got {gib})"
        )));
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
