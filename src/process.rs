// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServerIdentity;
use crate::error::SupervisorError;
use crate::state::RunState;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, info, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);
const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

pub const ACCESS_LOG: &str = "factorio-access.log";
pub const ERROR_LOG: &str = "factorio-error.log";

/// Whether clients are currently connected to the managed server. The
/// upgrade guard consults this before every teardown; how the answer is
/// obtained (an RCON query, usually) is the probe's business.
#[async_trait]
pub trait OccupancyProbe: Send + Sync {
    async fn is_occupied(&self) -> bool;
}

/// Probe for deployments with no client-side query wired up: always reports
/// an empty server.
pub struct NoClients;

#[async_trait]
impl OccupancyProbe for NoClients {
    async fn is_occupied(&self) -> bool {
        debug!("no occupancy probe configured, reporting no connected clients");
        false
    }
}

/// The single live child process. Created on a successful spawn, dropped on
/// confirmed stop or observed exit.
pub struct ManagedHandle {
    child: Child,
    pid: u32,
    started_at: Instant,
}

impl ManagedHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Owns the lifecycle of the managed server process. All state transitions
/// go through [`RunState::can_transition_to`]; no other component is allowed
/// to claim a different run state than reported here.
pub struct ProcessSupervisor {
    identity: ServerIdentity,
    state: RunState,
    handle: Option<ManagedHandle>,
    occupancy: Box<dyn OccupancyProbe>,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(identity: ServerIdentity, occupancy: Box<dyn OccupancyProbe>) -> Self {
        ProcessSupervisor {
            identity,
            state: RunState::Stopped,
            handle: None,
            occupancy,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Launch the server with the given startup arguments. Spawn success is
    /// the observable signal for `Running`; boot readiness is the binary's
    /// own affair. Output goes to the access/error logs under the mount.
    pub fn start(&mut self, args: &[String]) -> Result<u32, SupervisorError> {
        if self.state != RunState::Stopped {
            return Err(SupervisorError::AlreadyRunning { state: self.state });
        }
        self.transition(RunState::Starting);

        match self.try_spawn(args) {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                info!(pid, "server process spawned");
                self.handle = Some(ManagedHandle {
                    child,
                    pid,
                    started_at: Instant::now(),
                });
                self.transition(RunState::Running);
                Ok(pid)
            }
            Err(e) => {
                self.transition(RunState::Stopped);
                Err(e)
            }
        }
    }

    fn try_spawn(&self, args: &[String]) -> Result<Child, SupervisorError> {
        let access = log_destination(&self.identity.mount_root.join(ACCESS_LOG))?;
        let error = log_destination(&self.identity.mount_root.join(ERROR_LOG))?;

        let mut cmd = server_command(&self.identity);
        cmd.args(args)
            .stdout(access)
            .stderr(error)
            // Own process group, so stop() can signal forked helpers too.
            .process_group(0);

        cmd.spawn().map_err(|source| SupervisorError::ProcessStart {
            command: self.identity.server_binary(),
            source,
        })
    }

    /// Two-phase stop: SIGTERM to the process group, bounded wait, SIGKILL
    /// escalation. Always ends in `Stopped` with the handle cleared. Returns
    /// false when there was nothing to stop, without sending any signal.
    pub async fn stop(&mut self) -> bool {
        if self.state != RunState::Running {
            debug!("server is {}, nothing to stop", self.state);
            return false;
        }
        self.transition(RunState::Stopping);
        let Some(mut handle) = self.handle.take() else {
            self.transition(RunState::Stopped);
            return false;
        };

        info!(pid = handle.pid, "sending SIGTERM to the server process group");
        send_group_signal(handle.pid, Signal::SIGTERM);

        match timeout(self.stop_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "server process exited"),
            Ok(Err(e)) => warn!("failed waiting for the server process: {e}"),
            Err(_) => {
                warn!(
                    timeout_secs = self.stop_timeout.as_secs(),
                    "graceful stop timed out, sending SIGKILL to the process group"
                );
                send_group_signal(handle.pid, Signal::SIGKILL);
                if timeout(SIGKILL_TIMEOUT, handle.child.wait()).await.is_err() {
                    warn!(pid = handle.pid, "still running after SIGKILL, giving up");
                }
            }
        }

        self.transition(RunState::Stopped);
        true
    }

    /// Fold an unexpected child exit into the run state. Returns the exit
    /// status when the process turned out to be gone. This is the detected
    /// (not commanded) `Running -> Stopped` transition.
    pub fn observe_exit(&mut self) -> Option<ExitStatus> {
        let handle = self.handle.as_mut()?;
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                warn!(%status, "server process exited unexpectedly");
                self.handle = None;
                self.transition(RunState::Stopped);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("failed to poll the server process: {e}");
                None
            }
        }
    }

    /// Pure query over the supervisor's own transition log, not an OS probe.
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn handle(&self) -> Option<&ManagedHandle> {
        self.handle.as_ref()
    }

    pub async fn is_occupied(&self) -> bool {
        self.occupancy.is_occupied().await
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid run-state transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "run state changed");
        self.state = next;
    }
}

/// Base command for any invocation of the server binary, with the run-as
/// identity applied when one is configured.
pub(crate) fn server_command(identity: &ServerIdentity) -> Command {
    let mut cmd = Command::new(identity.server_binary());
    if let Some(run_as) = &identity.run_as {
        cmd.uid(run_as.uid).gid(run_as.gid);
    }
    cmd
}

pub(crate) fn log_destination(path: &Path) -> Result<std::fs::File, SupervisorError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| SupervisorError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}

fn send_group_signal(pid: u32, sig: Signal) {
    if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), sig) {
        warn!("failed to send {sig} to process group {pid}: {e}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ReleaseChannel;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub(crate) fn test_identity(root: &Path) -> ServerIdentity {
        ServerIdentity {
            mount_root: root.to_path_buf(),
            port: 34197,
            rcon_port: 27015,
            channel: ReleaseChannel::Stable,
            install_dir: root.join("opt").join("factorio"),
            run_as: None,
            poll_interval: Duration::from_secs(60),
            loop_interval: Duration::from_secs(5),
            releases_url: String::new(),
            download_url: String::new(),
        }
    }

    pub(crate) fn install_fake_binary(identity: &ServerIdentity, script: &str) {
        let binary = identity.server_binary();
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, script).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn supervisor(root: &Path, script: &str) -> ProcessSupervisor {
        let identity = test_identity(root);
        install_fake_binary(&identity, script);
        ProcessSupervisor::new(identity, Box::new(NoClients))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\nexec sleep 60\n");

        assert!(!sup.is_running());
        let pid = sup.start(&[]).unwrap();
        assert!(pid > 0);
        assert!(sup.is_running());
        assert_eq!(sup.handle().unwrap().pid(), pid);

        assert!(sup.stop().await);
        assert!(!sup.is_running());
        assert_eq!(sup.state(), RunState::Stopped);
        assert!(sup.handle().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\nexec sleep 60\n");
        assert!(!sup.stop().await);
        assert_eq!(sup.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\nexec sleep 60\n");
        sup.start(&[]).unwrap();

        let err = sup.start(&[]).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_start_spawn_failure_returns_to_stopped() {
        let root = tempfile::tempdir().unwrap();
        let identity = test_identity(root.path());
        // No binary installed at all.
        let mut sup = ProcessSupervisor::new(identity, Box::new(NoClients));

        let err = sup.start(&[]).unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessStart { .. }));
        assert_eq!(sup.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(
            root.path(),
            "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
        );
        sup.stop_timeout = Duration::from_secs(1);

        sup.start(&[]).unwrap();
        assert!(sup.stop().await);
        assert_eq!(sup.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_observe_exit_detects_crash() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\nexit 7\n");
        sup.start(&[]).unwrap();
        assert!(sup.is_running());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = sup.observe_exit().expect("exit should be observed");
        assert_eq!(status.code(), Some(7));
        assert!(!sup.is_running());
        assert!(sup.handle().is_none());
    }

    #[tokio::test]
    async fn test_observe_exit_on_live_process_is_none() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\nexec sleep 60\n");
        sup.start(&[]).unwrap();

        assert!(sup.observe_exit().is_none());
        assert!(sup.is_running());

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_default_probe_reports_unoccupied() {
        let root = tempfile::tempdir().unwrap();
        let sup = supervisor(root.path(), "#!/bin/sh\nexec sleep 60\n");
        assert!(!sup.is_occupied().await);
    }

    #[tokio::test]
    async fn test_output_routed_to_log_files() {
        let root = tempfile::tempdir().unwrap();
        let mut sup = supervisor(root.path(), "#!/bin/sh\necho hello-out\necho hello-err >&2\n");
        sup.start(&[]).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.observe_exit();

        let access = fs::read_to_string(root.path().join(ACCESS_LOG)).unwrap();
        let error = fs::read_to_string(root.path().join(ERROR_LOG)).unwrap();
        assert!(access.contains("hello-out"));
        assert!(error.contains("hello-err"));
    }
}
