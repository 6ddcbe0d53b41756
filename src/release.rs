// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::ReleaseChannel;
use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream lookup of the newest published version for a release channel.
/// Failures are transient by contract: callers skip the cycle and retry on
/// the next poll instead of tearing anything down.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_version(&self, channel: ReleaseChannel) -> Result<String, SupervisorError>;
}

/// The published per-channel version map. Each channel entry may omit the
/// headless build during a staggered rollout.
#[derive(Debug, Default, Deserialize)]
struct LatestReleases {
    #[serde(default)]
    stable: ChannelReleases,
    #[serde(default)]
    experimental: ChannelReleases,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelReleases {
    headless: Option<String>,
}

impl LatestReleases {
    fn headless_for(&self, channel: ReleaseChannel) -> Option<&str> {
        let entry = match channel {
            ReleaseChannel::Stable => &self.stable,
            ReleaseChannel::Experimental => &self.experimental,
        };
        entry.headless.as_deref()
    }
}

pub struct HttpReleaseSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReleaseSource {
    pub fn new(endpoint: &str) -> Result<Self, SupervisorError> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::Configuration {
                name: "RELEASES_URL",
                reason: format!("failed to build the release lookup client: {e}"),
            })?;
        Ok(HttpReleaseSource {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl ReleaseSource for HttpReleaseSource {
    async fn latest_version(&self, channel: ReleaseChannel) -> Result<String, SupervisorError> {
        let unavailable = |reason: String| SupervisorError::UpstreamUnavailable {
            channel: channel.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| unavailable(e.to_string()))?;

        let releases: LatestReleases = response
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed release listing: {e}")))?;

        let version = releases
            .headless_for(channel)
            .ok_or_else(|| unavailable("no headless build published for this channel".into()))?;
        debug!("latest {channel} headless release is {version}");
        Ok(version.to_string())
    }
}
