//! External command execution.
//!
//! Tool invocations are blocking. With a timeout configured, the child is
//! killed and reaped once the deadline passes.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::trace;
use wait_timeout::ChildExt;

use super::{EnforcementError, EnforcementResult};

/// Runs a program to completion and returns its standard output.
pub trait CommandRunner: Send + Sync {
    /// Runs `program args...`.
    ///
    /// # Errors
    ///
    /// Returns `Spawn` if the program cannot start, `CommandFailed` on a
    /// non-zero exit and `Timeout` if it overruns.
    fn run(&self, program: &str, args: &[String]) -> EnforcementResult<String>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    /// Creates a runner with an optional per-command timeout.
    #[must_use]
    pub const fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

/// Renders a command line for error messages.
#[must_use]
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut out = String::from(program);
    for arg in args {
        out.push(' ');
        if arg.contains(char::is_whitespace) {
            out.push('\'');
            out.push_str(arg);
            out.push('\'');
        } else {
            out.push_str(arg);
        }
    }
    out
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> EnforcementResult<String> {
        let command = display_command(program, args);
        trace!(command = %command, "running external command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EnforcementError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Drain both pipes on helper threads so a chatty child cannot block
        // on a full pipe while we wait on it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(limit) => match wait_with_timeout(&mut child, limit, &command)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EnforcementError::Timeout {
                        command,
                        after: limit,
                    });
                },
            },
            None => child.wait().map_err(|source| EnforcementError::Spawn {
                command: command.clone(),
                source,
            })?,
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            return Err(EnforcementError::CommandFailed {
                command,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

fn wait_with_timeout(
    child: &mut Child,
    limit: Duration,
    command: &str,
) -> EnforcementResult<Option<std::process::ExitStatus>> {
    child
        .wait_timeout(limit)
        .map_err(|source| EnforcementError::Spawn {
            command: command.to_string(),
            source,
        })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[test]
    fn captures_stdout() {
        let runner = SystemCommandRunner::default();
        let out = runner.run("sh", &args(&["-c", "echo hello"])).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn non_zero_exit_reports_stderr() {
        let runner = SystemCommandRunner::default();
        let err = runner
            .run("sh", &args(&["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        match err {
            EnforcementError::CommandFailed { stderr, command, .. } => {
                assert_eq!(stderr, "boom");
                assert!(command.starts_with("sh -c"), "{command}");
            },
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn missing_program_is_spawn_error() {
        let runner = SystemCommandRunner::default();
        assert!(matches!(
            runner.run("nonexistent_command_12345", &[]),
            Err(EnforcementError::Spawn { .. })
        ));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn slow_command_times_out() {
        let runner = SystemCommandRunner::new(Some(Duration::from_millis(100)));
        assert!(matches!(
            runner.run("sleep", &args(&["5"])),
            Err(EnforcementError::Timeout { .. })
        ));
    }

    #[test]
    fn display_quotes_whitespace() {
        assert_eq!(
            display_command("xfs_quota", &args(&["-x", "-c", "report -N -p"])),
            "xfs_quota -x -c 'report -N -p'"
        );
    }
}
