// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServerIdentity;
use crate::error::SupervisorError;
use crate::install::InstallManager;
use crate::paths::ServerPaths;
use crate::process::ProcessSupervisor;
use crate::release::ReleaseSource;
use crate::settings::{ConfigGenerator, SavePolicy};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives everything: polls for newer releases, tears down and reinstalls
/// when drift is detected and nobody is connected, and restarts the server
/// when it dies. One logical control thread; the managed process is the only
/// other execution in the system.
pub struct UpgradeController {
    identity: ServerIdentity,
    paths: ServerPaths,
    releases: Box<dyn ReleaseSource>,
    installer: InstallManager,
    supervisor: ProcessSupervisor,
    last_checked: Option<Instant>,
}

impl UpgradeController {
    pub fn new(
        identity: ServerIdentity,
        paths: ServerPaths,
        releases: Box<dyn ReleaseSource>,
        installer: InstallManager,
        supervisor: ProcessSupervisor,
    ) -> Self {
        UpgradeController {
            identity,
            paths,
            releases,
            installer,
            supervisor,
            last_checked: None,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn installer(&self) -> &InstallManager {
        &self.installer
    }

    /// Loop until cancelled, then stop the server gracefully before
    /// returning. Only fatal errors (configuration, failed rollback) abort
    /// the loop; everything else is retried on the next iteration.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        info!(
            "supervision loop starting for the {} channel",
            self.identity.channel
        );
        loop {
            if let Err(err) = self.run_once().await {
                if err.is_fatal() {
                    warn!("halting the supervision loop: {err}");
                    self.supervisor.stop().await;
                    return Err(err);
                }
                warn!("cycle failed, will retry next iteration: {err}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.identity.loop_interval) => {}
            }
        }
        info!("shutdown requested, stopping the server");
        self.supervisor.stop().await;
        Ok(())
    }

    /// A single loop iteration: cold install if nothing is installed,
    /// otherwise an upgrade check on the poll interval, then the
    /// self-healing restart.
    pub async fn run_once(&mut self) -> Result<(), SupervisorError> {
        if !self.identity.install_dir.exists() {
            info!("no installation found, performing a cold install");
            let latest = self.releases.latest_version(self.identity.channel).await?;
            self.installer.install(&latest).await?;
            self.start_server().await?;
            self.last_checked = Some(Instant::now());
            return Ok(());
        }

        if self.poll_due() {
            self.check_for_upgrade().await?;
        }

        self.supervisor.observe_exit();
        if !self.supervisor.is_running() {
            info!("server process is not running, starting it");
            self.start_server().await?;
        }
        Ok(())
    }

    fn poll_due(&self) -> bool {
        self.last_checked
            .is_none_or(|at| at.elapsed() >= self.identity.poll_interval)
    }

    async fn check_for_upgrade(&mut self) -> Result<(), SupervisorError> {
        debug!("checking for a newer {} release", self.identity.channel);
        let latest = match self.releases.latest_version(self.identity.channel).await {
            Ok(latest) => latest,
            Err(err) => {
                // Transient by contract: skip the cycle, ask again next poll.
                warn!("release lookup failed, skipping this cycle: {err}");
                self.last_checked = Some(Instant::now());
                return Ok(());
            }
        };

        if self.installer.is_installed(&latest) {
            debug!("installation is current at {latest}");
            self.last_checked = Some(Instant::now());
            return Ok(());
        }

        info!(
            installed = self.installer.installed_version().as_deref().unwrap_or("none"),
            latest = %latest,
            "installed version differs from the latest release"
        );
        if self.supervisor.is_occupied().await {
            info!("clients are connected, deferring the upgrade to {latest}");
            return Ok(());
        }

        info!("upgrading to {latest}");
        self.supervisor.stop().await;
        self.installer.install(&latest).await?;
        self.start_server().await?;
        self.last_checked = Some(Instant::now());
        Ok(())
    }

    async fn start_server(&mut self) -> Result<(), SupervisorError> {
        let args = ConfigGenerator::new(&self.identity, &self.paths)
            .startup_args(SavePolicy::AutoSelect)
            .await?;
        self.supervisor.start(&args)?;
        Ok(())
    }
}
