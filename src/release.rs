// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Build and instance identification.

use serde::Serialize;

const UNKNOWN: &str = "unknown";

/// Identifies the running agent build.
///
/// Commit, branch and build stamp come from the `HA_REPLICATOR_COMMIT`,
/// `HA_REPLICATOR_BRANCH` and `HA_REPLICATOR_BUILD_STAMP` environment
/// variables at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
    pub instance_id: String,
    pub version: String,
    pub commit: String,
    pub branch: String,
    pub build_timestamp: String,
}

impl ReleaseInfo {
    pub fn current(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("HA_REPLICATOR_COMMIT").unwrap_or(UNKNOWN).to_string(),
            branch: option_env!("HA_REPLICATOR_BRANCH").unwrap_or(UNKNOWN).to_string(),
            build_timestamp: option_env!("HA_REPLICATOR_BUILD_STAMP")
                .unwrap_or(UNKNOWN)
                .to_string(),
        }
    }
}

impl std::fmt::Display for ReleaseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{} ({}@{}, built {})",
            self.instance_id, self.version, self.commit, self.branch, self.build_timestamp
        )
    }
}
