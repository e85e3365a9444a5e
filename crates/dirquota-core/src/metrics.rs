//! Prometheus metrics for applied quota state.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `dirsize_total_size_bytes` | Gauge | Disk usage of a directory | `directory` |
//! | `dirsize_hard_limit_bytes` | Gauge | Hard limit of a directory (0 = none) | `directory` |
//! | `dirsize_reconcile_cycles_total` | Counter | Completed reconciliation cycles | `outcome` |
//!
//! Gauges are keyed by directory basename and overwritten on every publish.
//! A directory that disappears keeps its last published values. Basenames
//! are truncated to 64 bytes, so same-named directories under different
//! roots, or names sharing their first 64 bytes, share one series and the
//! last one published wins.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dirquota_core::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new()?;
//! registry.quota_metrics().publish(&applied);
//! let output = registry.encode_text()?;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::quota::QuotaRecord;

/// Namespace shared by every metric name.
pub const METRICS_NAMESPACE: &str = "dirsize";

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Outcome of one reconciliation cycle, as counted in
/// `dirsize_reconcile_cycles_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every step succeeded.
    Ok,
    /// The cycle finished but some roots or paths failed.
    Partial,
    /// The cycle aborted before enforcement.
    Failed,
}

impl CycleOutcome {
    /// Label value for this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Quota gauges and cycle counter.
///
/// All metrics use interior mutability; the struct is `Clone`, `Send`, and
/// `Sync`.
#[derive(Clone)]
pub struct QuotaMetrics {
    /// Disk usage in bytes, labeled by directory basename.
    total_size_bytes: GaugeVec,

    /// Hard block limit in bytes, labeled by directory basename.
    hard_limit_bytes: GaugeVec,

    /// Reconciliation cycles by outcome.
    reconcile_cycles_total: CounterVec,
}

impl QuotaMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let total_size_bytes = GaugeVec::new(
            Opts::new("total_size_bytes", "Total size of files in the directory")
                .namespace(METRICS_NAMESPACE),
            &["directory"],
        )?;
        registry.register(Box::new(total_size_bytes.clone()))?;

        let hard_limit_bytes = GaugeVec::new(
            Opts::new("hard_limit_bytes", "Hard limit on directory size, 0 if unlimited")
                .namespace(METRICS_NAMESPACE),
            &["directory"],
        )?;
        registry.register(Box::new(hard_limit_bytes.clone()))?;

        let reconcile_cycles_total = CounterVec::new(
            Opts::new("reconcile_cycles_total", "Reconciliation cycles by outcome")
                .namespace(METRICS_NAMESPACE),
            &["outcome"],
        )?;
        registry.register(Box::new(reconcile_cycles_total.clone()))?;

        Ok(Self {
            total_size_bytes,
            hard_limit_bytes,
            reconcile_cycles_total,
        })
    }

    /// Overwrites both gauges for every directory in `applied`.
    #[allow(clippy::cast_precision_loss)] // gauges are f64
    pub fn publish(&self, applied: &BTreeMap<PathBuf, QuotaRecord>) {
        for (path, record) in applied {
            let name = directory_label(path);
            let name = truncate_label(&name);
            self.total_size_bytes
                .with_label_values(&[name])
                .set(record.used_bytes() as f64);
            self.hard_limit_bytes
                .with_label_values(&[name])
                .set(record.hard_limit_bytes() as f64);
        }
    }

    /// Counts a finished cycle.
    pub fn cycle_completed(&self, outcome: CycleOutcome) {
        self.reconcile_cycles_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Last published size for a directory basename.
    ///
    /// This is primarily useful for testing.
    #[must_use]
    pub fn total_size(&self, directory: &str) -> f64 {
        self.total_size_bytes
            .with_label_values(&[truncate_label(directory)])
            .get()
    }

    /// Last published hard limit for a directory basename.
    #[must_use]
    pub fn hard_limit(&self, directory: &str) -> f64 {
        self.hard_limit_bytes
            .with_label_values(&[truncate_label(directory)])
            .get()
    }

    /// Number of cycles counted with `outcome`.
    #[must_use]
    pub fn cycle_count(&self, outcome: CycleOutcome) -> f64 {
        self.reconcile_cycles_total
            .with_label_values(&[outcome.as_str()])
            .get()
    }
}

/// Holds the Prometheus registry and the quota metrics registered with it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    quota_metrics: QuotaMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all quota metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let quota_metrics = QuotaMetrics::new(&registry)?;
        Ok(Self {
            registry,
            quota_metrics,
        })
    }

    /// The quota metrics.
    #[must_use]
    pub const fn quota_metrics(&self) -> &QuotaMetrics {
        &self.quota_metrics
    }

    /// Encodes all metrics in Prometheus text format, as served from
    /// `/metrics`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the daemon.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

fn directory_label(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

/// Truncates a label value at a UTF-8 boundary no later than
/// `MAX_LABEL_VALUE_LEN` bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
