// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::Result;
use factoriod::config::ServerIdentity;
use factoriod::controller::UpgradeController;
use factoriod::install::{HttpPayloadFetcher, InstallManager};
use factoriod::paths::ServerPaths;
use factoriod::process::{NoClients, ProcessSupervisor};
use factoriod::release::HttpReleaseSource;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("factoriod starting (version {})", env!("CARGO_PKG_VERSION"));

    let identity = ServerIdentity::from_env()?;
    let paths = ServerPaths::ensure(&identity.mount_root)?;

    let releases = Box::new(HttpReleaseSource::new(&identity.releases_url)?);
    let fetcher = Box::new(HttpPayloadFetcher::new(&identity.download_url)?);
    let installer = InstallManager::new(identity.clone(), paths.clone(), fetcher);
    let supervisor = ProcessSupervisor::new(identity.clone(), Box::new(NoClients));
    let mut controller = UpgradeController::new(identity, paths, releases, installer, supervisor);

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        trigger.cancel();
    });

    controller.run(shutdown).await?;
    info!("factoriod shut down cleanly");
    Ok(())
}
