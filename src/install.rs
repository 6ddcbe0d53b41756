// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::archive;
use crate::config::{RunAs, ServerIdentity};
use crate::error::SupervisorError;
use crate::paths::ServerPaths;
use async_trait::async_trait;
use futures::StreamExt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One file, one line: the source of truth for what is currently installed.
/// Written only after an install fully succeeds.
pub const VERSION_MARKER: &str = "VERSION";

/// Transport for a version's archive payload. The install sequence decides
/// where the archive lands; the fetcher only has to put it there.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, version: &str, dest: &Path) -> Result<(), SupervisorError>;
}

/// Streams `<base>/<version>/headless/linux64` to disk.
pub struct HttpPayloadFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPayloadFetcher {
    pub fn new(base_url: &str) -> Result<Self, SupervisorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| SupervisorError::Configuration {
                name: "DOWNLOAD_URL",
                reason: format!("failed to build the download client: {e}"),
            })?;
        Ok(HttpPayloadFetcher {
            client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, version: &str, dest: &Path) -> Result<(), SupervisorError> {
        let download_err = |source: io::Error| SupervisorError::Install {
            version: version.to_string(),
            stage: "downloading the payload",
            source,
        };

        let url = format!("{}/{version}/headless/linux64", self.base_url);
        info!("downloading {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| download_err(io::Error::other(e)))?
            .error_for_status()
            .map_err(|e| download_err(io::Error::other(e)))?;

        let mut out = BufWriter::new(fs::File::create(dest).map_err(download_err)?);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_err(io::Error::other(e)))?;
            out.write_all(&chunk).map_err(download_err)?;
        }
        out.flush().map_err(download_err)?;
        info!("payload for version {version} written to {}", dest.display());
        Ok(())
    }
}

/// Idempotently materializes a version's payload into the installation
/// directory, keeping the persistent data directories symlinked through
/// every reinstall and rolling back from a backup on failure.
pub struct InstallManager {
    identity: ServerIdentity,
    paths: ServerPaths,
    fetcher: Box<dyn PayloadFetcher>,
}

impl InstallManager {
    pub fn new(identity: ServerIdentity, paths: ServerPaths, fetcher: Box<dyn PayloadFetcher>) -> Self {
        InstallManager {
            identity,
            paths,
            fetcher,
        }
    }

    fn version_marker(&self) -> PathBuf {
        self.identity.mount_root.join(VERSION_MARKER)
    }

    pub fn installed_version(&self) -> Option<String> {
        fs::read_to_string(self.version_marker())
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|version| !version.is_empty())
    }

    pub fn is_installed(&self, version: &str) -> bool {
        self.identity.install_dir.is_dir() && self.installed_version().as_deref() == Some(version)
    }

    /// Install `version`, replacing whatever is in the install directory.
    /// The version marker changes only after every step has succeeded; any
    /// earlier failure triggers a rollback to the pre-install contents. A
    /// rollback failure is surfaced as [`SupervisorError::InstallRestoreFailed`]
    /// and must halt the caller.
    pub async fn install(&self, version: &str) -> Result<(), SupervisorError> {
        let install_dir = &self.identity.install_dir;
        let parent = install_parent(install_dir)?;
        let dir_name = install_dir_name(install_dir)?;
        fs::create_dir_all(parent).map_err(|source| SupervisorError::Install {
            version: version.to_string(),
            stage: "preparing the install parent",
            source,
        })?;

        let backup = parent.join(format!(".{dir_name}-preinstall.tar.gz"));
        let backup = if install_dir.exists() {
            info!("backing up the current installation to {}", backup.display());
            archive::pack_dir(install_dir, &backup).map_err(|source| SupervisorError::Install {
                version: version.to_string(),
                stage: "backing up the current installation",
                source,
            })?;
            fs::remove_dir_all(install_dir).map_err(|source| SupervisorError::Install {
                version: version.to_string(),
                stage: "removing the old installation",
                source,
            })?;
            Some(backup)
        } else {
            None
        };

        let payload = parent.join(format!("factorio-headless_linux_{version}.tar.gz"));
        let result = self.materialize(version, parent, &payload).await;
        if payload.exists() {
            if let Err(e) = fs::remove_file(&payload) {
                warn!("failed to remove the downloaded payload: {e}");
            }
        }

        match result {
            Ok(()) => {
                if let Some(backup) = backup {
                    if let Err(e) = fs::remove_file(&backup) {
                        warn!("failed to remove the pre-install backup: {e}");
                    }
                }
                info!("version {version} installed at {}", install_dir.display());
                Ok(())
            }
            Err(err) => {
                warn!("install of version {version} failed, rolling back: {err}");
                self.rollback(version, parent, backup.as_deref())?;
                Err(err)
            }
        }
    }

    async fn materialize(
        &self,
        version: &str,
        parent: &Path,
        payload: &Path,
    ) -> Result<(), SupervisorError> {
        let stage = |stage: &'static str| {
            move |source: io::Error| SupervisorError::Install {
                version: version.to_string(),
                stage,
                source,
            }
        };

        self.fetcher.fetch(version, payload).await?;

        info!("unpacking {} into {}", payload.display(), parent.display());
        archive::unpack(payload, parent).map_err(stage("unpacking the payload"))?;
        if !self.identity.install_dir.is_dir() {
            return Err(stage("unpacking the payload")(io::Error::new(
                io::ErrorKind::NotFound,
                "the payload did not contain the install directory",
            )));
        }

        self.link_persistent_dirs()
            .map_err(stage("linking persistent directories"))?;
        self.write_base_config()
            .map_err(stage("writing the base config.ini"))?;
        self.apply_ownership().map_err(stage("setting ownership"))?;

        fs::write(self.version_marker(), format!("{version}\n"))
            .map_err(stage("recording the installed version"))?;
        Ok(())
    }

    /// Best-effort return to the pre-install state: drop whatever partial
    /// tree exists and unpack the backup, if one was taken.
    fn rollback(
        &self,
        version: &str,
        parent: &Path,
        backup: Option<&Path>,
    ) -> Result<(), SupervisorError> {
        let restore_err = |source: io::Error| SupervisorError::InstallRestoreFailed {
            version: version.to_string(),
            source,
        };

        if self.identity.install_dir.exists() {
            fs::remove_dir_all(&self.identity.install_dir).map_err(restore_err)?;
        }
        let Some(backup) = backup else {
            return Ok(());
        };
        archive::unpack(backup, parent).map_err(restore_err)?;
        if let Err(e) = fs::remove_file(backup) {
            warn!("failed to remove the pre-install backup: {e}");
        }
        info!("previous installation restored");
        Ok(())
    }

    /// The persistent directories live under the mount; the installation
    /// sees them through symlinks, so replacing the install tree never
    /// touches their contents.
    fn link_persistent_dirs(&self) -> io::Result<()> {
        for (name, target) in self.paths.linked_dirs() {
            fs::create_dir_all(target)?;
            let link = self.identity.install_dir.join(name);
            match link.symlink_metadata() {
                // The payload may ship a real directory at this name.
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&link)?,
                Ok(_) => fs::remove_file(&link)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            std::os::unix::fs::symlink(target, &link)?;
            debug!("linked {} -> {}", link.display(), target.display());
        }
        Ok(())
    }

    fn write_base_config(&self) -> io::Result<()> {
        let path = self.paths.config_dir.join("config.ini");
        fs::write(&path, base_config_ini(&self.identity))
    }

    fn apply_ownership(&self) -> io::Result<()> {
        let Some(run_as) = &self.identity.run_as else {
            return Ok(());
        };
        info!(
            "chowning the installation and mount to {}:{}",
            run_as.user, run_as.group
        );
        chown_tree(&self.identity.install_dir, run_as)?;
        chown_tree(&self.identity.mount_root, run_as)
    }
}

fn base_config_ini(identity: &ServerIdentity) -> String {
    format!(
        "; generated by factoriod, replaced on every install\n\
         [path]\n\
         read-data=__PATH__executable__/../../data\n\
         write-data={}\n",
        identity.mount_root.display()
    )
}

fn install_parent(install_dir: &Path) -> Result<&Path, SupervisorError> {
    install_dir
        .parent()
        .ok_or_else(|| SupervisorError::Configuration {
            name: "FACTORIO_DIR",
            reason: "the install directory has no parent".to_string(),
        })
}

fn install_dir_name(install_dir: &Path) -> Result<&str, SupervisorError> {
    install_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SupervisorError::Configuration {
            name: "FACTORIO_DIR",
            reason: "the install directory has no usable name".to_string(),
        })
}

fn chown_tree(root: &Path, run_as: &RunAs) -> io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        std::os::unix::fs::lchown(entry.path(), Some(run_as.uid), Some(run_as.gid))?;
    }
    Ok(())
}
