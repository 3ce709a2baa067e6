//! Tunnel driver
//!
//! Owns the lifecycle of the one tunnel:
//!
//! ```text
//! Inactive --start--> Starting --ok--> Active --stop--> Stopping --ok--> Inactive
//!                         |                                 |
//!                         +-------------fail----------------+--> Error --stop--> Inactive
//! ```
//!
//! The state lives behind a mutex that is only held to read or flip it,
//! never across an await. Flipping to `Starting`/`Stopping` before the
//! daemon call is what rejects a second overlapping `start` or `stop`.
//! If the caller drops a `start` or `stop` future mid-call, the transition
//! lands in `Error("cancelled")` so that `stop` can clean up.

use crate::backend::Backend;
use crate::process::{Invocation, ProcessOutput, ProcessRunner};
use parking_lot::Mutex;
use safenet_common::keys::write_private_file;
use safenet_common::{DeviceName, Error, Result, TunnelState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Drives the external tunnel daemon for one tunnel name
pub struct TunnelDriver {
    name: DeviceName,
    backend: Backend,
    config_dir: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    command_timeout: Duration,
    status_timeout: Duration,
    state: Mutex<TunnelState>,
}

impl TunnelDriver {
    pub fn new(
        name: DeviceName,
        backend: Backend,
        config_dir: impl Into<PathBuf>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            name,
            backend,
            config_dir: config_dir.into(),
            runner,
            command_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            state: Mutex::new(TunnelState::Inactive),
        }
    }

    pub fn with_timeouts(mut self, command: Duration, status: Duration) -> Self {
        self.command_timeout = command;
        self.status_timeout = status;
        self
    }

    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Where the rendered config is written while the tunnel is up
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(Backend::config_file_name(&self.name))
    }

    /// Last known state, without asking the daemon
    pub fn state(&self) -> TunnelState {
        self.state.lock().clone()
    }

    /// Write `config_text` and activate the tunnel
    pub async fn start(&self, config_text: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TunnelState::Inactive => *state = TunnelState::Starting,
                TunnelState::Starting | TunnelState::Active => {
                    return Err(Error::AlreadyActive {
                        state: state.to_string(),
                    })
                }
                TunnelState::Stopping | TunnelState::Error(_) => {
                    return Err(Error::TransitionInProgress {
                        state: state.to_string(),
                    })
                }
            }
        }

        info!("Starting tunnel {} ({})", self.name, self.backend);
        let guard = Transition::new(self, true);
        let result = self.activate(config_text).await;
        guard.finish();

        match result {
            Ok(()) => {
                self.set_state(TunnelState::Active);
                info!("Tunnel {} is active", self.name);
                Ok(())
            }
            Err(e) => {
                self.set_state(TunnelState::Error(failure_reason(&e)));
                self.remove_config().await;
                Err(e)
            }
        }
    }

    async fn activate(&self, config_text: &str) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_path();
        write_private_file(&path, config_text.as_bytes()).await?;
        debug!("Wrote tunnel config to {:?} ({} bytes)", path, config_text.len());

        let absolute = absolute_path(&path)?;
        if !fs::try_exists(&absolute).await? {
            return Err(Error::Internal(format!(
                "Config file vanished before activation: {:?}",
                absolute
            )));
        }

        let invocation = self.backend.activate(&absolute);
        let output = self.run(&invocation, self.command_timeout).await?;
        if !output.success() {
            return Err(self.failed(&invocation, output));
        }
        Ok(())
    }

    /// Deactivate the tunnel and remove its config file
    ///
    /// From `Error` this is the cleanup path and tolerates a non-zero exit,
    /// since the service may never have been installed.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            match *state {
                TunnelState::Inactive => {
                    debug!("Tunnel {} already inactive", self.name);
                    return Ok(());
                }
                TunnelState::Starting | TunnelState::Stopping => {
                    return Err(Error::TransitionInProgress {
                        state: state.to_string(),
                    })
                }
                TunnelState::Active | TunnelState::Error(_) => {
                    std::mem::replace(&mut *state, TunnelState::Stopping)
                }
            }
        };

        info!("Stopping tunnel {}", self.name);
        let invocation = self.backend.deactivate(&self.name);
        let guard = Transition::new(self, false);
        let result = self.run(&invocation, self.command_timeout).await;
        guard.finish();

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.set_state(TunnelState::Error(failure_reason(&e)));
                return Err(e);
            }
        };

        if !output.success() {
            if previous.is_error() {
                warn!(
                    "{} exited with {:?} during cleanup: {}",
                    invocation.identity(),
                    output.status,
                    output.stderr.trim()
                );
            } else {
                let err = self.failed(&invocation, output);
                self.set_state(TunnelState::Error(failure_reason(&err)));
                return Err(err);
            }
        }

        self.remove_config().await;
        self.set_state(TunnelState::Inactive);
        info!("Tunnel {} stopped", self.name);
        Ok(())
    }

    /// Current state, reconciled with the daemon when no transition is in flight
    ///
    /// A sticky `Error` is returned as-is until `stop` clears it.
    pub async fn status(&self) -> Result<TunnelState> {
        {
            let state = self.state.lock();
            if state.is_transitioning() || state.is_error() {
                return Ok(state.clone());
            }
        }

        let invocation = self.backend.query(&self.name);
        let observed = match self.run(&invocation, self.status_timeout).await {
            Ok(output) => self.backend.parse_state(&output),
            Err(e @ Error::Timeout { .. }) => {
                warn!("Status query for {} timed out: {}", self.name, e);
                let timed_out = TunnelState::Error("timeout".to_string());
                let mut state = self.state.lock();
                if !state.is_transitioning() {
                    *state = timed_out.clone();
                }
                return Ok(timed_out);
            }
            Err(e) => return Err(e),
        };

        let went_down = {
            let mut state = self.state.lock();
            if state.is_transitioning() || state.is_error() {
                // A start or stop began while the query ran
                return Ok(state.clone());
            }
            match observed {
                TunnelState::Active | TunnelState::Inactive if *state != observed => {
                    debug!("Tunnel {} reconciled {} -> {}", self.name, state, observed);
                    let went_down = *state == TunnelState::Active;
                    *state = observed.clone();
                    went_down
                }
                _ => false,
            }
        };

        if went_down {
            warn!("Tunnel {} is no longer running", self.name);
            self.remove_config().await;
        }
        Ok(observed)
    }

    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput> {
        self.runner.run(invocation, timeout).await.map_err(|e| {
            if e.is_external() {
                error!("{} failed: {}", invocation.identity(), e);
            } else {
                warn!("{} could not be run: {}", invocation.identity(), e);
            }
            e
        })
    }

    fn failed(&self, invocation: &Invocation, output: ProcessOutput) -> Error {
        error!(
            "{} exited with {:?}: {}",
            invocation.identity(),
            output.status,
            output.stderr.trim()
        );
        output.into_failure(invocation)
    }

    fn set_state(&self, next: TunnelState) {
        *self.state.lock() = next;
    }

    async fn remove_config(&self) {
        let path = self.config_path();
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Removed tunnel config {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove tunnel config {:?}: {}", path, e),
        }
    }
}

/// Marks a `start` or `stop` whose daemon call never returned
struct Transition<'a> {
    driver: &'a TunnelDriver,
    remove_config: bool,
    done: bool,
}

impl<'a> Transition<'a> {
    fn new(driver: &'a TunnelDriver, remove_config: bool) -> Self {
        Self {
            driver,
            remove_config,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let driver = self.driver;
        warn!("Tunnel {} transition was cancelled", driver.name);
        driver.set_state(TunnelState::Error("cancelled".to_string()));

        // Drop cannot await; the config holds the hub key
        if self.remove_config {
            let path = driver.config_path();
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed tunnel config {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove tunnel config {:?}: {}", path, e),
            }
        }
    }
}

fn failure_reason(err: &Error) -> String {
    match err {
        Error::Timeout { .. } => "timeout".to_string(),
        other => other.to_string(),
    }
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use safenet_common::validate_name;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    enum Step {
        Exit(i32, &'static str),
        Stderr(i32, &'static str),
        Delayed(Duration, i32),
        Timeout,
        Missing,
    }

    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn programs(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.identity()).collect()
        }
    }

    #[async_trait]
    impl ProcessRunner for Scripted {
        async fn run(&self, invocation: &Invocation, _timeout: Duration) -> Result<ProcessOutput> {
            self.calls.lock().push(invocation.clone());
            let step = self.steps.lock().pop_front().unwrap_or(Step::Exit(0, ""));
            let exit = |code: i32, stdout: &str| ProcessOutput {
                status: Some(code),
                stdout: stdout.to_string(),
                stderr: if code == 0 { String::new() } else { "boom".to_string() },
            };
            match step {
                Step::Exit(code, stdout) => Ok(exit(code, stdout)),
                Step::Stderr(code, stderr) => Ok(ProcessOutput {
                    status: Some(code),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
                Step::Delayed(delay, code) => {
                    tokio::time::sleep(delay).await;
                    Ok(exit(code, ""))
                }
                Step::Timeout => Err(Error::Timeout {
                    command: invocation.identity(),
                    seconds: 1,
                }),
                Step::Missing => Err(Error::ToolMissing {
                    tool: invocation.program().to_string(),
                    hint: invocation.install_hint().to_string(),
                }),
            }
        }
    }

    fn driver(dir: &TempDir, runner: Arc<Scripted>) -> TunnelDriver {
        TunnelDriver::new(
            validate_name("safenet").unwrap(),
            Backend::WgQuick,
            dir.path().join("tunnels"),
            runner,
        )
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Exit(0, ""), Step::Exit(0, "")]);
        let driver = driver(&dir, runner.clone());

        driver.start("[Interface]\n").await.unwrap();
        assert_eq!(driver.state(), TunnelState::Active);
        assert!(driver.config_path().exists());

        let calls = runner.calls.lock().clone();
        assert_eq!(calls[0].args()[1], driver.config_path().into_os_string());

        driver.stop().await.unwrap();
        assert_eq!(driver.state(), TunnelState::Inactive);
        assert!(!driver.config_path().exists());
        assert_eq!(runner.programs(), vec!["wg-quick up", "ip link"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_config_written_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let driver = driver(&dir, Scripted::new(vec![]));
        driver.start("[Interface]\n").await.unwrap();
        let mode = std::fs::metadata(driver.config_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected_without_invoking() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![]);
        let driver = driver(&dir, runner.clone());

        driver.start("[Interface]\n").await.unwrap();
        let err = driver.start("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive { .. }));
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_start_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Delayed(Duration::from_millis(200), 0)]);
        let driver = Arc::new(driver(&dir, runner.clone()));

        let first = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.start("[Interface]\n").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.state(), TunnelState::Starting);

        let err = driver.start("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive { .. }));
        let err = driver.stop().await.unwrap_err();
        assert!(matches!(err, Error::TransitionInProgress { .. }));
        // In-flight state is reported without a query
        assert_eq!(driver.status().await.unwrap(), TunnelState::Starting);

        first.await.unwrap().unwrap();
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_inactive_is_noop() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![]);
        let driver = driver(&dir, runner.clone());

        driver.stop().await.unwrap();
        driver.stop().await.unwrap();
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_sticky_error() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Exit(1, "")]);
        let driver = driver(&dir, runner.clone());

        let err = driver.start("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, Error::ProcessFailure { status: Some(1), .. }));
        assert!(!driver.config_path().exists());

        assert!(driver.status().await.unwrap().is_error());
        assert!(driver.status().await.unwrap().is_error());
        // No status query reached the daemon
        assert_eq!(runner.calls.lock().len(), 1);

        let err = driver.start("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, Error::TransitionInProgress { .. }));
    }

    #[tokio::test]
    async fn test_error_recovers_through_stop() {
        let dir = TempDir::new().unwrap();
        // start fails, cleanup stop fails (no such device), start succeeds
        let runner = Scripted::new(vec![Step::Exit(1, ""), Step::Exit(1, ""), Step::Exit(0, "")]);
        let driver = driver(&dir, runner.clone());

        assert!(driver.start("[Interface]\n").await.is_err());
        driver.stop().await.unwrap();
        assert_eq!(driver.state(), TunnelState::Inactive);
        driver.start("[Interface]\n").await.unwrap();
        assert_eq!(driver.state(), TunnelState::Active);
    }

    #[tokio::test]
    async fn test_failed_stop_from_active() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Exit(0, ""), Step::Exit(2, "")]);
        let driver = driver(&dir, runner);

        driver.start("[Interface]\n").await.unwrap();
        let err = driver.stop().await.unwrap_err();
        assert!(matches!(err, Error::ProcessFailure { status: Some(2), .. }));
        assert!(driver.state().is_error());
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir, Scripted::new(vec![Step::Timeout]));

        let err = driver.start("[Interface]\n").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(driver.state(), TunnelState::Error("timeout".to_string()));
    }

    #[tokio::test]
    async fn test_status_timeout_reports_error() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir, Scripted::new(vec![Step::Timeout]));

        assert_eq!(
            driver.status().await.unwrap(),
            TunnelState::Error("timeout".to_string())
        );
        assert!(driver.state().is_error());
    }

    #[tokio::test]
    async fn test_missing_tool_surfaces_hint() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir, Scripted::new(vec![Step::Missing]));

        match driver.start("[Interface]\n").await.unwrap_err() {
            Error::ToolMissing { tool, hint } => {
                assert_eq!(tool, "wg-quick");
                assert!(hint.contains("wireguard-tools"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_reconciles_with_daemon() {
        let dir = TempDir::new().unwrap();
        // Daemon already has the tunnel up, then it disappears
        let runner = Scripted::new(vec![
            Step::Exit(0, "interface: safenet"),
            Step::Stderr(1, "Unable to access interface: No such device"),
        ]);
        let driver = driver(&dir, runner);

        assert_eq!(driver.status().await.unwrap(), TunnelState::Active);
        assert_eq!(driver.state(), TunnelState::Active);
        assert_eq!(driver.status().await.unwrap(), TunnelState::Inactive);
        assert_eq!(driver.state(), TunnelState::Inactive);
    }

    #[tokio::test]
    async fn test_name_is_single_argument() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![]);
        let driver = TunnelDriver::new(
            validate_name("corp_net-1").unwrap(),
            Backend::WindowsService,
            dir.path(),
            runner.clone(),
        );
        driver.status().await.unwrap();
        let calls = runner.calls.lock().clone();
        assert_eq!(calls[0].program(), "sc");
        assert_eq!(calls[0].args().len(), 2);
        assert_eq!(calls[0].args()[1], "WireGuardTunnel$corp_net-1");
    }

    #[tokio::test]
    async fn test_cancelled_start_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Delayed(Duration::from_millis(500), 0)]);
        let driver = driver(&dir, runner.clone());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), driver.start("[Interface]\n")).await;
        assert!(cancelled.is_err());
        assert_eq!(driver.state(), TunnelState::Error("cancelled".to_string()));
        assert!(!driver.config_path().exists());

        driver.stop().await.unwrap();
        assert_eq!(driver.state(), TunnelState::Inactive);
        driver.start("[Interface]\n").await.unwrap();
        assert_eq!(driver.state(), TunnelState::Active);
        assert_eq!(runner.programs(), vec!["wg-quick up", "ip link", "wg-quick up"]);
    }

    #[tokio::test]
    async fn test_cancelled_stop_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![
            Step::Exit(0, ""),
            Step::Delayed(Duration::from_millis(500), 0),
        ]);
        let driver = driver(&dir, runner);

        driver.start("[Interface]\n").await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(50), driver.stop()).await;
        assert!(cancelled.is_err());
        assert!(driver.state().is_error());

        driver.stop().await.unwrap();
        assert_eq!(driver.state(), TunnelState::Inactive);
        assert!(!driver.config_path().exists());
    }

    #[tokio::test]
    async fn test_status_query_failure_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let runner = Scripted::new(vec![Step::Stderr(
            1,
            "Unable to access interface: Operation not permitted",
        )]);
        let driver = driver(&dir, runner);

        assert!(driver.status().await.unwrap().is_error());
        assert_eq!(driver.state(), TunnelState::Inactive);
    }
}
