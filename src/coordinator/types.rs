//! Cluster state types.
//!
//! Defines the health state machine of the master/slave pair.
//!
//! # State Transitions
//!
//! ```text
//!                      bootstrap done
//! Bootstrapping ──────────────────────→ Healthy ←────────────┐
//!                                        │  ↑                 │
//!                       (divergence)     │  │ (in sync)       │
//!                                        ↓  │                 │
//!                                      Resyncing              │ (both up)
//!                                                             │
//!           (a node down) ──→ MasterDown / SlaveDown / BothDown
//! ```
//!
//! # State Descriptions
//!
//! - **Bootstrapping**: Waiting for both nodes to be configured and reachable.
//! - **Healthy**: Both nodes up, slave within tolerance of the master.
//! - **Resyncing**: Both nodes up, divergence detected; repair in progress.
//! - **MasterDown**: Master unreachable. No reads from the master.
//! - **SlaveDown**: Slave unreachable. No writes to the slave.
//! - **BothDown**: Neither node reachable.

use crate::error::ReplicationError;
use crate::monitor::NodeHealth;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Health state of the pair.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Bootstrapping,
    Healthy,
    MasterDown,
    SlaveDown,
    BothDown,
    Resyncing,
}

impl ClusterState {
    /// States in which the supervisor compares and repairs.
    pub fn allows_replication(&self) -> bool {
        matches!(self, ClusterState::Healthy | ClusterState::Resyncing)
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Bootstrapping => write!(f, "Bootstrapping"),
            ClusterState::Healthy => write!(f, "Healthy"),
            ClusterState::MasterDown => write!(f, "MasterDown"),
            ClusterState::SlaveDown => write!(f, "SlaveDown"),
            ClusterState::BothDown => write!(f, "BothDown"),
            ClusterState::Resyncing => write!(f, "Resyncing"),
        }
    }
}

/// Cluster state from node aliveness and the outcome of the last comparison.
pub fn derive_state(master_up: bool, slave_up: bool, in_sync: bool) -> ClusterState {
    match (master_up, slave_up) {
        (true, true) if in_sync => ClusterState::Healthy,
        (true, true) => ClusterState::Resyncing,
        (true, false) => ClusterState::SlaveDown,
        (false, true) => ClusterState::MasterDown,
        (false, false) => ClusterState::BothDown,
    }
}

/// One-shot replication run right after bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationStrategy {
    #[default]
    None,
    SchemaOnly,
    DataOnly,
    Both,
}

impl ReplicationStrategy {
    pub fn includes_schema(&self) -> bool {
        matches!(self, ReplicationStrategy::SchemaOnly | ReplicationStrategy::Both)
    }

    pub fn includes_data(&self) -> bool {
        matches!(self, ReplicationStrategy::DataOnly | ReplicationStrategy::Both)
    }
}

impl FromStr for ReplicationStrategy {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(ReplicationStrategy::None),
            "schema" => Ok(ReplicationStrategy::SchemaOnly),
            "data" => Ok(ReplicationStrategy::DataOnly),
            "both" => Ok(ReplicationStrategy::Both),
            other => Err(ReplicationError::Config(format!(
                "unknown initial_replication '{}' (expected none, schema, data or both)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ReplicationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStrategy::None => write!(f, "none"),
            ReplicationStrategy::SchemaOnly => write!(f, "schema"),
            ReplicationStrategy::DataOnly => write!(f, "data"),
            ReplicationStrategy::Both => write!(f, "both"),
        }
    }
}

/// Outcome of one supervisor cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// State at the end of the cycle.
    pub state: ClusterState,
    /// Descriptors compared.
    pub descriptors: usize,
    /// Descriptors beyond tolerance or missing on the slave.
    pub divergent: usize,
    pub schema_created: usize,
    pub points_copied: usize,
    /// Largest master/slave last-point gap seen.
    pub max_lag: Duration,
    pub duration: Duration,
    /// Repair stopped early on shutdown.
    pub interrupted: bool,
    /// Error that ended the cycle early.
    pub error: Option<String>,
}

impl CycleReport {
    pub(crate) fn new(state: ClusterState) -> Self {
        Self {
            state,
            descriptors: 0,
            divergent: 0,
            schema_created: 0,
            points_copied: 0,
            max_lag: Duration::ZERO,
            duration: Duration::ZERO,
            interrupted: false,
            error: None,
        }
    }
}

/// Point-in-time view of the coordinator.
///
/// **Performance**: collected from cached state only, no network I/O.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub state: ClusterState,
    pub master: NodeHealth,
    pub slave: NodeHealth,
    pub last_master_ok: Option<SystemTime>,
    pub last_slave_ok: Option<SystemTime>,
    pub last_cycle: Option<CycleReport>,
}
