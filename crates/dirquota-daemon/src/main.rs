//! dirquota-daemon - keeps XFS project quotas on home directories in sync.
//!
//! Every `--wait-time` seconds the daemon discovers home directories under
//! the configured roots, updates `/etc/projid` and `/etc/projects`, and
//! applies the configured hard limits through `xfs_quota`. Applied usage and
//! limits are exported on a Prometheus endpoint.
//!
//! # Startup
//!
//! Configuration is read from `--config` (TOML) if given, then command-line
//! flags are overlaid field by field. Invalid configuration is fatal; once
//! the loop is running no single cycle's failure stops the process.
//!
//! Cycles run on a blocking thread because every quota operation shells out
//! to an external tool. SIGTERM and SIGINT stop the loop between cycles.

mod shutdown;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use dirquota_core::config::{ConfigOverrides, QuotaConfig, parse_override};
use dirquota_core::engine::Engine;
use dirquota_core::metrics::{SharedMetricsRegistry, new_shared_registry};
use dirquota_core::quota::{SystemCommandRunner, XfsQuota};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::shutdown::Shutdown;

type XfsEngine = Engine<XfsQuota<SystemCommandRunner>>;

/// dirquota daemon - per-directory XFS project quota reconciler
#[derive(Parser, Debug)]
#[command(name = "dirquota-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Root paths whose immediate subdirectories receive quotas
    paths: Vec<PathBuf>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reverse registry file (`id:path`)
    #[arg(long)]
    projects_file: Option<PathBuf>,

    /// Forward registry file (`path:id`)
    #[arg(long)]
    projid_file: Option<PathBuf>,

    /// Lowest project id to assign
    #[arg(long)]
    min_projid: Option<u32>,

    /// Seconds to wait between reconciliation cycles
    #[arg(long, value_name = "SECS")]
    wait_time: Option<u64>,

    /// Default hard limit per directory, in GiB
    #[arg(long, value_name = "GIB")]
    hard_quota: Option<f64>,

    /// Directory basename that gets no limit (repeatable)
    #[arg(long, value_name = "NAME")]
    exclude: Vec<String>,

    /// Per-directory limit overriding the default and exclusions (repeatable)
    #[arg(long = "quota-override", value_name = "NAME=GIB", value_parser = parse_override)]
    quota_overrides: Vec<(String, f64)>,

    /// Run a single cycle and exit; non-zero exit if anything failed
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Address for the Prometheus metrics endpoint
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Disable Prometheus metrics HTTP endpoint
    #[arg(long)]
    no_metrics: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            paths: self.paths.clone(),
            projects_file: self.projects_file.clone(),
            projid_file: self.projid_file.clone(),
            min_projid: self.min_projid,
            wait_time_secs: self.wait_time,
            hard_quota_gib: self.hard_quota,
            exclude: self.exclude.clone(),
            quota_overrides: self.quota_overrides.clone(),
            metrics_bind: self.metrics_bind,
            no_metrics: self.no_metrics,
        }
    }
}

/// Builds the effective configuration: file (if any), then flags.
fn load_config(args: &Args) -> Result<QuotaConfig> {
    let mut config = match &args.config {
        Some(path) => QuotaConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => QuotaConfig::default(),
    };
    config.apply_overrides(args.overrides());
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn async_main(args: Args, config: QuotaConfig) -> Result<ExitCode> {
    init_logging(&args)?;
    info!(
        roots = ?config.paths,
        projid_file = %config.projid_file.display(),
        projects_file = %config.projects_file.display(),
        min_projid = config.min_projid,
        hard_quota_gib = config.hard_quota_gib,
        wait_time_secs = config.wait_time_secs,
        "starting dirquota-daemon"
    );

    let backend = XfsQuota::new(SystemCommandRunner::new(config.command_timeout()));
    let mut engine = Engine::new(config.clone(), backend);

    if args.once {
        let (_, result) = run_cycle(engine).await?;
        return Ok(match result {
            Ok(report) if report.is_clean() => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        });
    }

    let metrics_task = if config.metrics.enabled {
        let registry = new_shared_registry().context("failed to create metrics registry")?;
        engine = engine.with_metrics(registry.quota_metrics().clone());
        let addr = config.metrics.bind;
        info!(addr = %addr, "Starting metrics HTTP server");
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(registry, addr).await {
                error!("Metrics server error: {e:#}");
            }
        }))
    } else {
        info!("Metrics HTTP server disabled");
        None
    };

    let shutdown = Arc::new(Shutdown::new());
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
        signal_shutdown.request_shutdown();
    });

    let result = run_loop(engine, config.wait_time(), &shutdown).await;

    if let Some(task) = metrics_task {
        task.abort();
    }
    info!("dirquota-daemon stopped");
    result.map(|()| ExitCode::SUCCESS)
}

/// Runs one cycle on the blocking pool and hands the engine back.
async fn run_cycle(
    mut engine: XfsEngine,
) -> Result<(XfsEngine, dirquota_core::engine::EngineResult<dirquota_core::CycleReport>)> {
    tokio::task::spawn_blocking(move || {
        let result = engine.reconcile_step();
        (engine, result)
    })
    .await
    .context("reconciliation task panicked")
}

async fn run_loop(mut engine: XfsEngine, wait: Duration, shutdown: &Shutdown) -> Result<()> {
    loop {
        let (returned, result) = run_cycle(engine).await?;
        engine = returned;
        if let Ok(report) = &result {
            for root in &report.failed_roots {
                warn!(root = %root.display(), "root skipped this cycle");
            }
        }

        if shutdown.is_shutdown_requested() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = shutdown.requested() => {}
        }
        if shutdown.is_shutdown_requested() {
            break;
        }
    }
    info!("Shutdown requested, leaving reconciliation loop");
    Ok(())
}

/// Serves `GET /metrics` in Prometheus text format.
async fn run_metrics_server(
    metrics_registry: SharedMetricsRegistry,
    addr: SocketAddr,
) -> Result<()> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let metrics_handler = move || {
        let registry = Arc::clone(&metrics_registry);
        async move {
            match registry.encode_text() {
                Ok(body) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    body,
                )
                    .into_response(),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to encode metrics: {e}"),
                    )
                        .into_response()
                },
            }
        }
    };

    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!(addr = %addr, "Metrics HTTP server listening");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("dirquota-daemon").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn flags_map_onto_config() {
        let args = parse(&[
            "/export/home",
            "/export/shared",
            "--min-projid",
            "2000",
            "--wait-time",
            "5",
            "--hard-quota",
            "0.5",
            "--exclude",
            "admin",
            "--exclude",
            "shared",
            "--quota-override",
            "alice=20",
            "--no-metrics",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(
            config.paths,
            vec![PathBuf::from("/export/home"), PathBuf::from("/export/shared")]
        );
        assert_eq!(config.min_projid, 2000);
        assert_eq!(config.wait_time(), Duration::from_secs(5));
        assert!((config.hard_quota_gib - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.exclude, vec!["admin".to_string(), "shared".to_string()]);
        assert_eq!(config.quota_overrides.get("alice"), Some(&20.0));
        assert!(!config.metrics.enabled);
        assert_eq!(config.projid_file, PathBuf::from("/etc/projid"));
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
paths = ["/from/file"]
hard_quota_gib = 0.003
exclude = ["c", "d"]
wait_time_secs = 60
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&["--config", &path, "--hard-quota", "0.001"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.paths, vec![PathBuf::from("/from/file")]);
        assert!((config.hard_quota_gib - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.exclude, vec!["c".to_string(), "d".to_string()]);
        assert_eq!(config.wait_time_secs, 60);

        let args = parse(&["--config", &path, "/from/cli"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.paths, vec![PathBuf::from("/from/cli")]);
    }

    #[test]
    fn missing_paths_is_fatal() {
        let args = parse(&["--hard-quota", "1"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn missing_explicit_config_file_is_fatal() {
        let args = parse(&["--config", "/nonexistent/dirquota.toml", "/export/home"]);
        let err = load_config(&args).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/dirquota.toml"));
    }

    #[test]
    fn malformed_quota_override_is_rejected_by_parser() {
        let result = Args::try_parse_from([
            "dirquota-daemon",
            "/export/home",
            "--quota-override",
            "alice",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn metrics_bind_is_parsed() {
        let args = parse(&["/export/home", "--metrics-bind", "0.0.0.0:9200"]);
        let config = load_config(&args).unwrap();
        assert!(config.metrics.enabled);
        assert_eq!(
            config.metrics.bind,
            "0.0.0.0:9200".parse::<SocketAddr>().unwrap()
        );
    }
}
