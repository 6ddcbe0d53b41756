// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::SupervisorError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Data directories rooted under the mount, shared by every installation.
/// Install and upgrade operations replace the binary payload only; these
/// directories are never deleted.
#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub saves_dir: PathBuf,
    pub config_dir: PathBuf,
    pub mods_dir: PathBuf,
    pub scenarios_dir: PathBuf,
    pub script_output_dir: PathBuf,
}

impl ServerPaths {
    /// Create any missing directory under `mount_root`. Idempotent: calling
    /// this against an already-provisioned mount is a no-op.
    pub fn ensure(mount_root: &Path) -> Result<Self, SupervisorError> {
        let paths = ServerPaths {
            saves_dir: mount_root.join("saves"),
            config_dir: mount_root.join("config"),
            mods_dir: mount_root.join("mods"),
            scenarios_dir: mount_root.join("scenarios"),
            script_output_dir: mount_root.join("script-output"),
        };
        for dir in [
            &paths.saves_dir,
            &paths.config_dir,
            &paths.mods_dir,
            &paths.scenarios_dir,
            &paths.script_output_dir,
        ] {
            init_dir(dir)?;
        }
        Ok(paths)
    }

    /// The directories that survive reinstalls by being symlinked into the
    /// installation directory. `script-output` stays outside the install
    /// tree and is not linked.
    pub fn linked_dirs(&self) -> [(&'static str, &Path); 4] {
        [
            ("saves", &self.saves_dir),
            ("config", &self.config_dir),
            ("mods", &self.mods_dir),
            ("scenarios", &self.scenarios_dir),
        ]
    }
}

fn init_dir(path: &Path) -> Result<(), SupervisorError> {
    debug!("ensuring directory {}", path.display());
    if path.exists() && !path.is_dir() {
        return Err(SupervisorError::Filesystem {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::NotADirectory,
                "path exists but is not a directory",
            ),
        });
    }
    fs::create_dir_all(path).map_err(|source| SupervisorError::Filesystem {
        path: path.to_path_buf(),
        source,
    })
}
