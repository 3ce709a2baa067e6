//! External process boundary
//!
//! An `Invocation` is a program plus a discrete argument vector. There is no
//! constructor taking a command string and no shell in between, so a name or
//! path can only ever be a single argv entry. Invocations are built by
//! `Backend` and executed by a `ProcessRunner`.

use async_trait::async_trait;
use safenet_common::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A single external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: &'static str,
    args: Vec<OsString>,
    install_hint: &'static str,
}

impl Invocation {
    pub(crate) fn new(program: &'static str, install_hint: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            install_hint,
        }
    }

    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn program(&self) -> &'static str {
        self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Remediation shown when the program is not installed
    pub fn install_hint(&self) -> &'static str {
        self.install_hint
    }

    /// Program and its leading verb, used as the command identity in errors
    ///
    /// Backends always put a fixed verb or flag first, so this never carries
    /// a path or name.
    pub fn identity(&self) -> String {
        match self.args.first() {
            Some(verb) => format!("{} {}", self.program, verb.to_string_lossy()),
            None => self.program.to_string(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {:?}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into `ProcessFailure`
    pub fn into_failure(self, invocation: &Invocation) -> Error {
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Error::ProcessFailure {
            command: invocation.identity(),
            status: self.status,
            stderr,
        }
    }
}

/// Executes invocations with a bounded wait
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput>;
}

/// Runs invocations as real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput> {
        debug!("Executing: {}", invocation);

        let child = Command::new(invocation.program())
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::ToolMissing {
                    tool: invocation.program().to_string(),
                    hint: invocation.install_hint().to_string(),
                },
                _ => Error::Io(e),
            })?;

        // Dropping the future on timeout kills the child
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    command: invocation.identity(),
                    seconds: timeout.as_secs(),
                })
            }
        };

        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_stay_discrete() {
        let inv = Invocation::new("wg", "").arg("show").arg("dev;rm -rf /");
        assert_eq!(inv.args().len(), 2);
        assert_eq!(inv.args()[1], OsString::from("dev;rm -rf /"));
    }

    #[test]
    fn test_identity() {
        let inv = Invocation::new("wireguard.exe", "").arg("/installtunnelservice").arg("C:\\x\\safenet.conf");
        assert_eq!(inv.identity(), "wireguard.exe /installtunnelservice");
        let inv = Invocation::new("wg-quick", "").arg("up");
        assert_eq!(inv.identity(), "wg-quick up");
    }

    #[test]
    fn test_failure_prefers_stderr() {
        let inv = Invocation::new("wg-quick", "").arg("up");
        let out = ProcessOutput {
            status: Some(1),
            stdout: "noise".to_string(),
            stderr: "RTNETLINK answers: Operation not permitted\n".to_string(),
        };
        match out.into_failure(&inv) {
            Error::ProcessFailure { command, status, stderr } => {
                assert_eq!(command, "wg-quick up");
                assert_eq!(status, Some(1));
                assert_eq!(stderr, "RTNETLINK answers: Operation not permitted");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_tool() {
        let inv = Invocation::new("safenet-definitely-not-installed", "Install it.");
        let err = TokioRunner.run(&inv, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::ToolMissing { ref hint, .. } if hint == "Install it."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_captured() {
        let inv = Invocation::new("sh", "").arg("-c").arg("echo oops >&2; exit 3");
        let out = TokioRunner.run(&inv, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let inv = Invocation::new("sleep", "").arg("5");
        let err = TokioRunner.run(&inv, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
