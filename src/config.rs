// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::SupervisorError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RELEASES_URL: &str = "https://factorio.com/api/latest-releases";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://www.factorio.com/get-download";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// Release track used to look up the current version token upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseChannel {
    Stable,
    Experimental,
}

impl FromStr for ReleaseChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(ReleaseChannel::Stable),
            "experimental" => Ok(ReleaseChannel::Experimental),
            other => Err(format!(
                "unknown release channel {other:?}, expected \"stable\" or \"experimental\""
            )),
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseChannel::Stable => write!(f, "stable"),
            ReleaseChannel::Experimental => write!(f, "experimental"),
        }
    }
}

/// Identity the server process runs under, resolved from names to ids once
/// at startup so later chown/setuid calls cannot fail on a missing account.
#[derive(Debug, Clone)]
pub struct RunAs {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

impl RunAs {
    pub fn resolve(user: &str, group: &str) -> Result<Self, SupervisorError> {
        let uid = uzers::get_user_by_name(user)
            .ok_or_else(|| SupervisorError::Configuration {
                name: "RUN_AS_USER",
                reason: format!("no such user: {user}"),
            })?
            .uid();
        let gid = uzers::get_group_by_name(group)
            .ok_or_else(|| SupervisorError::Configuration {
                name: "RUN_AS_GROUP",
                reason: format!("no such group: {group}"),
            })?
            .gid();
        Ok(RunAs {
            user: user.to_string(),
            group: group.to_string(),
            uid,
            gid,
        })
    }
}

/// Immutable description of the managed server, built once at startup.
/// This is the only place the ambient process environment is consulted;
/// every other component receives it by reference.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub mount_root: PathBuf,
    pub port: u16,
    pub rcon_port: u16,
    pub channel: ReleaseChannel,
    pub install_dir: PathBuf,
    pub run_as: Option<RunAs>,
    pub poll_interval: Duration,
    pub loop_interval: Duration,
    pub releases_url: String,
    pub download_url: String,
}

impl ServerIdentity {
    pub fn from_env() -> Result<Self, SupervisorError> {
        let mount_root = PathBuf::from(required("MOUNT_DIR")?);
        let port = parse_port("PORT", &required("PORT")?)?;
        let rcon_port = parse_port("RCON_PORT", &required("RCON_PORT")?)?;
        let channel = required("RELEASE_CHANNEL")?.parse().map_err(|reason| {
            SupervisorError::Configuration {
                name: "RELEASE_CHANNEL",
                reason,
            }
        })?;
        let install_dir = PathBuf::from(required("FACTORIO_DIR")?);

        let run_as = match (optional("RUN_AS_USER"), optional("RUN_AS_GROUP")) {
            (Some(user), Some(group)) => Some(RunAs::resolve(&user, &group)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(SupervisorError::Configuration {
                    name: "RUN_AS_GROUP",
                    reason: "RUN_AS_USER is set but RUN_AS_GROUP is not".to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(SupervisorError::Configuration {
                    name: "RUN_AS_USER",
                    reason: "RUN_AS_GROUP is set but RUN_AS_USER is not".to_string(),
                });
            }
        };

        Ok(ServerIdentity {
            mount_root,
            port,
            rcon_port,
            channel,
            install_dir,
            run_as,
            poll_interval: parse_interval("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?,
            loop_interval: parse_interval("LOOP_INTERVAL_SECS", DEFAULT_LOOP_INTERVAL)?,
            releases_url: optional("RELEASES_URL").unwrap_or_else(|| DEFAULT_RELEASES_URL.into()),
            download_url: optional("DOWNLOAD_URL").unwrap_or_else(|| DEFAULT_DOWNLOAD_URL.into()),
        })
    }

    /// Path of the headless server executable inside the installation.
    pub fn server_binary(&self) -> PathBuf {
        self.install_dir.join("bin").join("x64").join("factorio")
    }
}

fn required(name: &'static str) -> Result<String, SupervisorError> {
    std::env::var(name).map_err(|_| SupervisorError::Configuration {
        name,
        reason: "environment variable is not set".to_string(),
    })
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_port(name: &'static str, value: &str) -> Result<u16, SupervisorError> {
    value.parse().map_err(|_| SupervisorError::Configuration {
        name,
        reason: format!("{value:?} is not a valid port number"),
    })
}

fn parse_interval(name: &'static str, default: Duration) -> Result<Duration, SupervisorError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| SupervisorError::Configuration {
                name,
                reason: format!("{raw:?} is not a valid number of seconds"),
            }),
    }
}
