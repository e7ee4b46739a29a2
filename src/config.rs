// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication agent.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML. The agent reads it through a [`ConfigSource`] so that bootstrap can
//! pick up a corrected node list and `reload()` can re-read it from disk.
//!
//! # Configuration Structure
//!
//! ```text
//! AgentConfig
//! ├── general: GeneralConfig
//! │   ├── instance_id: String          # Reported in release info
//! │   ├── master_db / slave_db         # Node names (must exist in `nodes`)
//! │   ├── check_interval: "10s"        # Node probe interval
//! │   ├── min_sync_interval: "20s"     # Supervisor cycle interval
//! │   ├── monitor_retry_interval: "1m" # Bootstrap retry sleep
//! │   ├── initial_replication: "none"  # none | schema | data | both
//! │   └── ...                          # Backfill and divergence tuning
//! └── nodes: Vec<NodeConfig>           # Database instances
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! general:
//!   instance_id: "ha-pair-1"
//!   master_db: "influx01"
//!   slave_db: "influx02"
//!   check_interval: "10s"
//!   initial_replication: "both"
//!
//! nodes:
//!   - name: "influx01"
//!     url: "http://influx01:8086"
//!     user: "admin"
//!     password: "secret"
//!   - name: "influx02"
//!     url: "http://influx02:8086"
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Cluster-wide settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Database instances. Exactly two of them are used: the ones named by
    /// `general.master_db` and `general.slave_db`.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Create a minimal master/slave config for testing.
    pub fn for_testing(master: &str, slave: &str) -> Self {
        Self {
            general: GeneralConfig {
                master_db: master.to_string(),
                slave_db: slave.to_string(),
                ..GeneralConfig::default()
            },
            nodes: vec![
                NodeConfig::for_testing(master, &format!("http://{}:8086", master)),
                NodeConfig::for_testing(slave, &format!("http://{}:8086", slave)),
            ],
        }
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// The configured master node, if present.
    pub fn master(&self) -> Option<&NodeConfig> {
        self.node(&self.general.master_db)
    }

    /// The configured slave node, if present.
    pub fn slave(&self) -> Option<&NodeConfig> {
        self.node(&self.general.slave_db)
    }

    /// Check the configuration for problems an operator has to fix.
    ///
    /// Returns every problem found, not just the first one.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.topology_problems();
        if let Err(e) = self.general.initial_replication.parse::<crate::coordinator::ReplicationStrategy>() {
            problems.push(e.to_string());
        }
        problems
    }

    /// Problems that keep the pair from being assembled at all.
    ///
    /// An unknown initial strategy is left out: it only skips the one-shot copy.
    pub fn topology_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let general = &self.general;

        if general.master_db.is_empty() {
            problems.push("general.master_db is empty".to_string());
        } else if self.master().is_none() {
            problems.push(format!("no node named '{}' (master_db)", general.master_db));
        }
        if general.slave_db.is_empty() {
            problems.push("general.slave_db is empty".to_string());
        } else if self.slave().is_none() {
            problems.push(format!("no node named '{}' (slave_db)", general.slave_db));
        }
        if !general.master_db.is_empty() && general.master_db == general.slave_db {
            problems.push("master_db and slave_db name the same node".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                problems.push(format!("duplicate node name '{}'", node.name));
            }
            if node.url.is_empty() {
                problems.push(format!("node '{}' has no url", node.name));
            }
        }

        if general.failure_threshold == 0 {
            problems.push("general.failure_threshold must be at least 1".to_string());
        }
        if general.max_points_per_write == 0 {
            problems.push("general.max_points_per_write must be at least 1".to_string());
        }
        problems
    }

    /// Validate, folding all problems into one [`ReplicationError::Config`].
    pub fn validate(&self) -> Result<()> {
        fold_problems(self.problems())
    }

    /// Like [`validate`](Self::validate), restricted to [`topology_problems`](Self::topology_problems).
    pub fn validate_topology(&self) -> Result<()> {
        fold_problems(self.topology_problems())
    }
}

fn fold_problems(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReplicationError::Config(problems.join("; ")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GeneralConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster-wide settings.
///
/// Durations are humantime strings ("10s", "1m", "24h"); malformed values
/// fall back to the default for that field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Identifier of this agent instance.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Name of the node treated as source of truth.
    #[serde(default)]
    pub master_db: String,

    /// Name of the node kept in sync with the master.
    #[serde(default)]
    pub slave_db: String,

    /// How often each node monitor probes its node.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// How often the supervisor compares master and slave.
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval: String,

    /// Bootstrap sleep between attempts while a node is missing or down.
    #[serde(default = "default_monitor_retry_interval")]
    pub monitor_retry_interval: String,

    /// One-shot replication after bootstrap: none | schema | data | both.
    #[serde(default = "default_initial_replication")]
    pub initial_replication: String,

    /// Width of each read window during backfill.
    #[serde(default = "default_data_chunk_duration")]
    pub data_chunk_duration: String,

    /// Maximum points sent in a single write call.
    #[serde(default = "default_max_points_per_write")]
    pub max_points_per_write: usize,

    /// Lag between master and slave last-point timestamps still counted as in sync.
    #[serde(default = "default_sync_tolerance")]
    pub sync_tolerance: String,

    /// Upper bound on how far back an incremental resync reaches.
    #[serde(default = "default_max_resync_window")]
    pub max_resync_window: String,

    /// Optional cap on how far back the initial `data` strategy copies.
    /// Empty (the default) copies everything.
    #[serde(default = "default_full_backfill_window")]
    pub full_backfill_window: String,

    /// Consecutive failed probes before a node is reported down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_instance_id() -> String {
    "ha-replicator".to_string()
}

fn default_check_interval() -> String {
    "10s".to_string()
}

fn default_min_sync_interval() -> String {
    "20s".to_string()
}

fn default_monitor_retry_interval() -> String {
    "1m".to_string()
}

fn default_initial_replication() -> String {
    "none".to_string()
}

fn default_data_chunk_duration() -> String {
    "1h".to_string()
}

fn default_max_points_per_write() -> usize {
    5000
}

fn default_sync_tolerance() -> String {
    "1m".to_string()
}

fn default_max_resync_window() -> String {
    "24h".to_string()
}

fn default_full_backfill_window() -> String {
    String::new()
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            master_db: String::new(),
            slave_db: String::new(),
            check_interval: default_check_interval(),
            min_sync_interval: default_min_sync_interval(),
            monitor_retry_interval: default_monitor_retry_interval(),
            initial_replication: default_initial_replication(),
            data_chunk_duration: default_data_chunk_duration(),
            max_points_per_write: default_max_points_per_write(),
            sync_tolerance: default_sync_tolerance(),
            max_resync_window: default_max_resync_window(),
            full_backfill_window: default_full_backfill_window(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Parse a humantime string, falling back when malformed or zero.
fn parse_or(value: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(value) {
        Ok(d) if !d.is_zero() => d,
        _ => fallback,
    }
}

impl GeneralConfig {
    pub fn check_interval_duration(&self) -> Duration {
        parse_or(&self.check_interval, Duration::from_secs(10))
    }

    pub fn min_sync_interval_duration(&self) -> Duration {
        parse_or(&self.min_sync_interval, Duration::from_secs(20))
    }

    pub fn monitor_retry_interval_duration(&self) -> Duration {
        parse_or(&self.monitor_retry_interval, Duration::from_secs(60))
    }

    pub fn data_chunk_duration(&self) -> Duration {
        parse_or(&self.data_chunk_duration, Duration::from_secs(3600))
    }

    pub fn sync_tolerance_duration(&self) -> Duration {
        // Zero tolerance is legal here: it means "exact last-point match".
        humantime::parse_duration(&self.sync_tolerance).unwrap_or(Duration::from_secs(60))
    }

    pub fn max_resync_window_duration(&self) -> Duration {
        parse_or(&self.max_resync_window, Duration::from_secs(24 * 3600))
    }

    /// Optional cap on how far back the initial `data` strategy reaches.
    ///
    /// `None` (empty, zero or malformed) copies the whole history.
    pub fn full_backfill_window_duration(&self) -> Option<Duration> {
        match humantime::parse_duration(&self.full_backfill_window) {
            Ok(d) if !d.is_zero() => Some(d),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one entry per database instance
// ═══════════════════════════════════════════════════════════════════════════════

/// Role a node plays in the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}

/// Connection descriptor for a single database instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique name referenced by `master_db` / `slave_db`.
    pub name: String,

    /// Base URL, e.g. `"http://influx01:8086"`.
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Per-call timeout (probe and queries).
    #[serde(default = "default_node_timeout")]
    pub timeout: String,
}

fn default_node_timeout() -> String {
    "5s".to_string()
}

// Credentials stay out of logs.
impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NodeConfig {
    /// Parse the timeout string to a Duration.
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(5))
    }

    /// Create a node config for testing.
    pub fn for_testing(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            user: String::new(),
            password: String::new(),
            timeout: default_node_timeout(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConfigSource: where the agent reads configuration from
// ═══════════════════════════════════════════════════════════════════════════════

/// Supplies the current configuration.
///
/// Called once per bootstrap attempt and once per `reload()`.
pub trait ConfigSource: Send + Sync + 'static {
    fn load(&self) -> Result<AgentConfig>;
}

/// Reads a YAML file on every `load()`.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<AgentConfig> {
        AgentConfig::from_file(&self.path)
    }
}

/// In-memory configuration that can be swapped at runtime.
///
/// Cloning shares the underlying value.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    inner: Arc<RwLock<AgentConfig>>,
}

impl StaticConfigSource {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace the configuration seen by subsequent `load()` calls.
    pub fn set(&self, config: AgentConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Modify the configuration in place.
    pub fn update(&self, f: impl FnOnce(&mut AgentConfig)) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<AgentConfig> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| ReplicationError::Internal("config lock poisoned".to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
