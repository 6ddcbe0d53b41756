// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::state::RunState;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("missing or invalid setting {name}: {reason}")]
    Configuration { name: &'static str, reason: String },

    #[error("failed to prepare {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to materialize {name} from {}: {source}", .template.display())]
    ConfigTemplate {
        name: &'static str,
        template: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to query the latest {channel} release: {reason}")]
    UpstreamUnavailable { channel: String, reason: String },

    #[error("install of version {version} failed while {stage}: {source}")]
    Install {
        version: String,
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(
        "install of version {version} failed and the previous installation could not be restored: {source}"
    )]
    InstallRestoreFailed {
        version: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {}: {source}", .command.display())]
    ProcessStart {
        command: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start: the server process is {state}")]
    AlreadyRunning { state: RunState },

    #[error("refusing to overwrite existing save {}", .path.display())]
    SaveExists { path: PathBuf },

    #[error("failed to create save {name}: the server exited with {status}")]
    CreateSave { name: String, status: ExitStatus },
}

impl SupervisorError {
    /// Errors that must halt the control loop instead of being retried on the
    /// next iteration. A failed rollback means the installation directory is
    /// in an unknown state and blindly reinstalling could compound it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::Configuration { .. } | SupervisorError::InstallRestoreFailed { .. }
        )
    }
}
