// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ServerIdentity;
use crate::error::SupervisorError;
use crate::paths::ServerPaths;
use crate::process::{self, ACCESS_LOG, ERROR_LOG};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RCON_PASSWORD_LEN: usize = 15;
const DEFAULT_SAVE_NAME: &str = "default_save";

pub const CONSOLE_LOG: &str = "factorio-console.log";

/// Which save the server starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePolicy {
    /// A specific save by name (without the `.zip` suffix).
    Named(String),
    /// Let the server pick the most recent save.
    LoadLatest,
    /// Load the latest save if any exist, otherwise create a default one
    /// first and start from it.
    AutoSelect,
}

/// Builds the server's startup argument list from the persisted settings
/// files, materializing any missing one from the examples bundled with the
/// installation. Recomputed on every start; never persisted.
pub struct ConfigGenerator<'a> {
    identity: &'a ServerIdentity,
    paths: &'a ServerPaths,
}

impl<'a> ConfigGenerator<'a> {
    pub fn new(identity: &'a ServerIdentity, paths: &'a ServerPaths) -> Self {
        ConfigGenerator { identity, paths }
    }

    /// Resolve `<config>/<name>.json`, copying the bundled
    /// `<install>/data/<name>.example.json` into place when absent. An
    /// existing file is never touched.
    pub fn settings_file(&self, name: &'static str) -> Result<PathBuf, SupervisorError> {
        let target = self.paths.config_dir.join(format!("{name}.json"));
        if !target.is_file() {
            let template = self
                .identity
                .install_dir
                .join("data")
                .join(format!("{name}.example.json"));
            fs::copy(&template, &target).map_err(|source| SupervisorError::ConfigTemplate {
                name,
                template,
                source,
            })?;
            info!("materialized {name}.json from the bundled example");
        }
        Ok(target)
    }

    /// The durable RCON credential. Generated once, then read back verbatim
    /// on every subsequent start.
    pub fn rcon_password(&self) -> Result<String, SupervisorError> {
        let path = self.paths.config_dir.join("rconpw");
        if path.is_file() {
            let contents =
                fs::read_to_string(&path).map_err(|source| SupervisorError::Filesystem {
                    path: path.clone(),
                    source,
                })?;
            return Ok(contents.trim().to_string());
        }
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RCON_PASSWORD_LEN)
            .map(char::from)
            .collect();
        fs::write(&path, &password).map_err(|source| SupervisorError::Filesystem {
            path: path.clone(),
            source,
        })?;
        info!("generated a new rcon password at {}", path.display());
        Ok(password)
    }

    pub fn has_saves(&self) -> Result<bool, SupervisorError> {
        let entries = fs::read_dir(&self.paths.saves_dir).map_err(|source| {
            SupervisorError::Filesystem {
                path: self.paths.saves_dir.clone(),
                source,
            }
        })?;
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the server binary to completion to create a new save. Refuses to
    /// overwrite an existing one.
    pub async fn create_save(
        &self,
        name: &str,
        preset: Option<&str>,
    ) -> Result<PathBuf, SupervisorError> {
        let save_path = self.paths.saves_dir.join(format!("{name}.zip"));
        if save_path.exists() {
            return Err(SupervisorError::SaveExists { path: save_path });
        }

        let map_gen_settings = self.settings_file("map-gen-settings")?;
        let map_settings = self.settings_file("map-settings")?;

        let mut cmd = process::server_command(self.identity);
        cmd.arg("--create")
            .arg(&save_path)
            .arg("--map-gen-settings")
            .arg(&map_gen_settings)
            .arg("--map-settings")
            .arg(&map_settings)
            .stdout(process::log_destination(
                &self.identity.mount_root.join(ACCESS_LOG),
            )?)
            .stderr(process::log_destination(
                &self.identity.mount_root.join(ERROR_LOG),
            )?);
        if let Some(preset) = preset {
            cmd.arg("--preset").arg(preset);
        }

        info!("creating save {name}");
        let status = cmd
            .status()
            .await
            .map_err(|source| SupervisorError::ProcessStart {
                command: self.identity.server_binary(),
                source,
            })?;
        if !status.success() {
            return Err(SupervisorError::CreateSave {
                name: name.to_string(),
                status,
            });
        }
        info!("created save {}", save_path.display());
        Ok(save_path)
    }

    /// The full startup argument list for the given save policy. Resolves
    /// every settings file first so a missing template aborts the start
    /// before anything is launched.
    pub async fn startup_args(&self, policy: SavePolicy) -> Result<Vec<String>, SupervisorError> {
        let server_settings = self.settings_file("server-settings")?;
        let server_whitelist = self.settings_file("server-whitelist")?;
        self.settings_file("map-gen-settings")?;
        self.settings_file("map-settings")?;

        let mut args = vec![
            "--port".to_string(),
            self.identity.port.to_string(),
            "--rcon-port".to_string(),
            self.identity.rcon_port.to_string(),
            "--server-settings".to_string(),
            path_arg(&server_settings),
            "--server-banlist".to_string(),
            path_arg(&self.paths.config_dir.join("server-banlist.json")),
            "--server-whitelist".to_string(),
            path_arg(&server_whitelist),
            "--use-server-whitelist".to_string(),
            "--server-adminlist".to_string(),
            path_arg(&self.paths.config_dir.join("server-adminlist.json")),
            "--rcon-password".to_string(),
            self.rcon_password()?,
            "--server-id".to_string(),
            path_arg(&self.paths.config_dir.join("server-id.json")),
            "--mod-directory".to_string(),
            path_arg(&self.paths.mods_dir),
            "--console-log".to_string(),
            path_arg(&self.identity.mount_root.join(CONSOLE_LOG)),
        ];

        match policy {
            SavePolicy::Named(name) => {
                args.push("--start-server".to_string());
                args.push(path_arg(&self.paths.saves_dir.join(format!("{name}.zip"))));
            }
            SavePolicy::LoadLatest => args.push("--start-server-load-latest".to_string()),
            SavePolicy::AutoSelect => {
                if self.has_saves()? {
                    debug!("saves exist, loading the latest");
                    args.push("--start-server-load-latest".to_string());
                } else {
                    info!("no saves found, creating {DEFAULT_SAVE_NAME}");
                    let save = self.create_save(DEFAULT_SAVE_NAME, None).await?;
                    args.push("--start-server".to_string());
                    args.push(path_arg(&save));
                }
            }
        }

        debug!("generated startup arguments: {args:?}");
        Ok(args)
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
