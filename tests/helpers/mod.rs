// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use factoriod::archive;
use factoriod::config::{ReleaseChannel, ServerIdentity};
use factoriod::error::SupervisorError;
use factoriod::install::PayloadFetcher;
use factoriod::process::OccupancyProbe;
use factoriod::release::ReleaseSource;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, thread};

/// Identity pointed at a scratch directory, with intervals tightened so a
/// test can drive one iteration at a time.
pub fn test_identity(root: &Path) -> ServerIdentity {
    ServerIdentity {
        mount_root: root.join("factorio"),
        port: 34197,
        rcon_port: 27015,
        channel: ReleaseChannel::Stable,
        install_dir: root.join("opt").join("factorio"),
        run_as: None,
        poll_interval: Duration::ZERO,
        loop_interval: Duration::from_millis(10),
        releases_url: String::new(),
        download_url: String::new(),
    }
}

/// Build a payload archive shaped like a headless release. The fake binary
/// touches the save file when asked to `--create` and otherwise idles.
pub fn build_payload(scratch: &Path, version: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let tree = scratch.join(format!("stage-{version}")).join("factorio");
    fs::create_dir_all(tree.join("bin/x64")).unwrap();
    fs::create_dir_all(tree.join("data")).unwrap();

    let binary = tree.join("bin/x64/factorio");
    fs::write(
        &binary,
        concat!(
            "#!/bin/sh\n",
            "prev=\"\"\n",
            "for arg in \"$@\"; do\n",
            "  case \"$prev\" in --create) : > \"$arg\"; exit 0;; esac\n",
            "  prev=\"$arg\"\n",
            "done\n",
            "exec sleep 300\n",
        ),
    )
    .unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

    for name in [
        "server-settings",
        "server-whitelist",
        "map-gen-settings",
        "map-settings",
    ] {
        fs::write(tree.join(format!("data/{name}.example.json")), "{}").unwrap();
    }
    fs::write(tree.join("data/payload-version"), version).unwrap();

    let archive_path = scratch.join(format!("payload-{version}.tar.gz"));
    archive::pack_dir(&tree, &archive_path).unwrap();
    archive_path
}

/// Release source answering with whatever version the test last set, or
/// simulating an upstream outage.
#[derive(Clone)]
pub struct StubRelease {
    version: Arc<Mutex<String>>,
    failing: Arc<AtomicBool>,
}

impl StubRelease {
    pub fn new(version: &str) -> Self {
        StubRelease {
            version: Arc::new(Mutex::new(version.to_string())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReleaseSource for StubRelease {
    async fn latest_version(&self, channel: ReleaseChannel) -> Result<String, SupervisorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SupervisorError::UpstreamUnavailable {
                channel: channel.to_string(),
                reason: "simulated outage".to_string(),
            });
        }
        Ok(self.version.lock().unwrap().clone())
    }
}

/// Fetcher serving prebuilt archives out of a map keyed by version.
pub struct MapFetcher(pub HashMap<String, PathBuf>);

#[async_trait]
impl PayloadFetcher for MapFetcher {
    async fn fetch(&self, version: &str, dest: &Path) -> Result<(), SupervisorError> {
        let archive = self.0.get(version).ok_or_else(|| SupervisorError::Install {
            version: version.to_string(),
            stage: "downloading the payload",
            source: io::Error::new(io::ErrorKind::NotFound, "no archive for this version"),
        })?;
        fs::copy(archive, dest).map_err(|source| SupervisorError::Install {
            version: version.to_string(),
            stage: "downloading the payload",
            source,
        })?;
        Ok(())
    }
}

/// Occupancy probe the test can flip while the controller runs.
#[derive(Clone)]
pub struct StubOccupancy(Arc<AtomicBool>);

impl StubOccupancy {
    pub fn new() -> Self {
        StubOccupancy(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_occupied(&self, occupied: bool) {
        self.0.store(occupied, Ordering::SeqCst);
    }
}

#[async_trait]
impl OccupancyProbe for StubOccupancy {
    async fn is_occupied(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn pid_is_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    !pid_is_alive(pid)
}
