//! `xfs_quota` backend.
//!
//! # Report format
//!
//! `report -N -p -b -i -r` prints one line per project without headers:
//!
//! ```text
//! <name> <used> <soft> <hard> <warn> <grace> [x3: blocks, inodes, realtime]
//! ```
//!
//! Block figures are KiB. `<name>` is the projid-file name (the directory
//! path here) or `#<id>` when the id has no name. Grace is either a bare
//! token or a bracketed span such as `[6 days]`, which is rejoined before
//! columns are counted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::command::{CommandRunner, SystemCommandRunner};
use super::{
    EnforcementError, EnforcementResult, QuotaBackend, QuotaLimits, QuotaRecord, Usage,
};
use crate::registry::{ProjectId, ProjectRegistry, RegistryFiles};

/// Program used for all quota operations.
pub const XFS_QUOTA: &str = "xfs_quota";

/// Columns per quota category in a report line.
const GROUP_COLUMNS: usize = 5;

/// `xfs_quota`-backed quota subsystem.
#[derive(Debug, Clone, Default)]
pub struct XfsQuota<R = SystemCommandRunner> {
    runner: R,
}

impl<R: CommandRunner> XfsQuota<R> {
    /// Creates a backend that executes through `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    fn xfs_quota(
        &self,
        files: &RegistryFiles,
        command: String,
        mountpoint: Option<&Path>,
    ) -> EnforcementResult<String> {
        let mut args = vec![
            "-D".to_string(),
            files.projects_file.display().to_string(),
            "-P".to_string(),
            files.projid_file.display().to_string(),
            "-x".to_string(),
            "-c".to_string(),
            command,
        ];
        if let Some(mount) = mountpoint {
            args.push(mount.display().to_string());
        }
        self.runner.run(XFS_QUOTA, &args)
    }
}

impl<R: CommandRunner> QuotaBackend for XfsQuota<R> {
    fn applied_quotas(
        &self,
        files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, QuotaRecord>> {
        let output = self.xfs_quota(files, "report -N -p -b -i -r".to_string(), None)?;
        let mut quotas = BTreeMap::new();
        for (name, record) in parse_report(&output)? {
            if name.starts_with('#') {
                continue;
            }
            quotas.insert(PathBuf::from(name), record);
        }
        debug!(projects = quotas.len(), "read applied quotas");
        Ok(quotas)
    }

    fn applied_projects(
        &self,
        files: &RegistryFiles,
    ) -> EnforcementResult<BTreeMap<PathBuf, ProjectId>> {
        let output = self.xfs_quota(files, "report -N -p -n".to_string(), None)?;
        let reverse = ProjectRegistry::new(files.clone()).load_reverse()?;
        let mut projects = BTreeMap::new();
        for (line, (name, _)) in parse_report(&output)?.into_iter().enumerate() {
            let id = name
                .strip_prefix('#')
                .and_then(|raw| raw.parse::<ProjectId>().ok())
                .ok_or_else(|| EnforcementError::ReportParse {
                    line: line + 1,
                    reason: format!("expected numeric project '#<id>', got '{name}'"),
                })?;
            if let Some(path) = reverse.path_of(id) {
                projects.insert(path.to_path_buf(), id);
            }
        }
        Ok(projects)
    }

    fn mountpoint_for(&self, path: &Path) -> EnforcementResult<PathBuf> {
        let output = self.runner.run(
            "df",
            &["--output=target".to_string(), path.display().to_string()],
        )?;
        parse_df_target(&output).ok_or_else(|| EnforcementError::Mountpoint {
            path: path.display().to_string(),
            reason: "df printed no target".to_string(),
        })
    }

    fn setup_project(
        &self,
        files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        mountpoint: &Path,
    ) -> EnforcementResult<()> {
        check_path(path)?;
        self.xfs_quota(
            files,
            format!("project -s -p {} {id}", path.display()),
            Some(mountpoint),
        )?;
        Ok(())
    }

    fn set_limit(
        &self,
        files: &RegistryFiles,
        path: &Path,
        id: ProjectId,
        mountpoint: &Path,
        limits: &QuotaLimits,
    ) -> EnforcementResult<()> {
        check_path(path)?;
        self.xfs_quota(files, limit_command(id, limits), Some(mountpoint))?;
        Ok(())
    }
}

/// `limit` subcommand setting every field of `limits` on project `id`.
#[must_use]
pub fn limit_command(id: ProjectId, limits: &QuotaLimits) -> String {
    format!(
        "limit -p bsoft={}k bhard={}k isoft={} ihard={} rtbsoft={}k rtbhard={}k {id}",
        limits.block_soft_kib,
        limits.block_hard_kib,
        limits.inode_soft,
        limits.inode_hard,
        limits.rt_soft_kib,
        limits.rt_hard_kib,
    )
}

/// `xfs_quota -c` splits its argument on whitespace, so such paths cannot
/// be passed through.
fn check_path(path: &Path) -> EnforcementResult<()> {
    let text = path.to_str().ok_or_else(|| EnforcementError::UnsupportedPath {
        path: path.display().to_string(),
        reason: "not valid UTF-8".to_string(),
    })?;
    if text.contains(char::is_whitespace) {
        return Err(EnforcementError::UnsupportedPath {
            path: text.to_string(),
            reason: "contains whitespace".to_string(),
        });
    }
    Ok(())
}

/// Last non-empty line of `df --output=target`.
fn parse_df_target(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(PathBuf::from)
}

/// Splits a report line into columns, keeping `[...]` spans together.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut open: Option<String> = None;
    for word in line.split_whitespace() {
        match open.as_mut() {
            Some(span) => {
                span.push(' ');
                span.push_str(word);
                if word.ends_with(']') {
                    tokens.extend(open.take());
                }
            },
            None if word.starts_with('[') && !word.ends_with(']') => {
                open = Some(word.to_string());
            },
            None => tokens.push(word.to_string()),
        }
    }
    tokens.extend(open);
    tokens
}

fn parse_group(columns: &[String], line: usize) -> EnforcementResult<Usage> {
    let number = |idx: usize, what: &str| {
        columns[idx]
            .parse::<u64>()
            .map_err(|_| EnforcementError::ReportParse {
                line,
                reason: format!("{what} column '{}' is not a number", columns[idx]),
            })
    };
    Ok(Usage {
        used: number(0, "used")?,
        soft: number(1, "soft")?,
        hard: number(2, "hard")?,
    })
}

/// Parses `report -N` output into `(name, record)` pairs in report order.
///
/// # Errors
///
/// Returns `EnforcementError::ReportParse` if a line does not have one, two
/// or three groups of five columns after the name, or a figure is not a
/// number.
pub fn parse_report(output: &str) -> EnforcementResult<Vec<(String, QuotaRecord)>> {
    let mut records = Vec::new();
    for (idx, raw) in output.lines().enumerate() {
        let line = idx + 1;
        let tokens = tokenize(raw);
        let Some((name, rest)) = tokens.split_first() else {
            continue;
        };
        if rest.is_empty() || rest.len() % GROUP_COLUMNS != 0 || rest.len() > 3 * GROUP_COLUMNS {
            return Err(EnforcementError::ReportParse {
                line,
                reason: format!(
                    "expected 5, 10 or 15 columns after the name, got {}",
                    rest.len()
                ),
            });
        }
        let mut groups = rest.chunks(GROUP_COLUMNS);
        let mut next = || -> EnforcementResult<Usage> {
            groups
                .next()
                .map_or(Ok(Usage::default()), |cols| parse_group(cols, line))
        };
        let record = QuotaRecord {
            blocks: next()?,
            inodes: next()?,
            realtime: next()?,
        };
        records.push((name.clone(), record));
    }
    Ok(records)
}
