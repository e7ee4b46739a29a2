//! # HA Replicator
//!
//! A high-availability replication agent that keeps a slave time-series
//! database in step with its master.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              ha-replicator                                │
//! │                                                                           │
//! │  ┌─────────────┐   bootstrap   ┌────────────────────────────────────────┐ │
//! │  │   Agent     │──────────────►│ ClusterCoordinator                     │ │
//! │  │ start/stop/ │               │  ┌─────────────┐   ┌─────────────────┐ │ │
//! │  │ reload/copy │               │  │ NodeMonitor │   │ Supervisor      │ │ │
//! │  └─────────────┘               │  │ (master)    │──►│ compare/repair  │ │ │
//! │                                │  ├─────────────┤   │                 │ │ │
//! │                                │  │ NodeMonitor │──►│                 │ │ │
//! │                                │  │ (slave)     │   └────────┬────────┘ │ │
//! │                                │  └─────────────┘            │          │ │
//! │                                └─────────────────────────────┼──────────┘ │
//! │                                                              ▼            │
//! │                                        TsdbDriver (HTTP / in-memory)      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replication
//!
//! 1. **Bootstrap**: block until master and slave are configured and alive
//! 2. **Initial strategy**: one-shot `none`, `schema`, `data` or `both`
//! 3. **Supervisor**: every `min_sync_interval`, compare last-point
//!    timestamps per measurement and copy what the slave is missing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ha_replicator::{Agent, FileConfigSource, HttpDriverFactory};
//!
//! #[tokio::main]
//! async fn main() {
//!     let agent = Agent::new(FileConfigSource::new("agent.yaml"), HttpDriverFactory);
//!     agent.start().await.expect("Failed to start");
//!
//!     // Agent runs until stopped
//!     tokio::signal::ctrl_c().await.ok();
//!     agent.stop().await.ok();
//! }
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod release;

// Re-exports for convenience
pub use agent::Agent;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{AgentConfig, ConfigSource, FileConfigSource, GeneralConfig, NodeConfig, NodeRole, StaticConfigSource};
pub use coordinator::{ClusterCoordinator, ClusterState, ClusterStatus, CycleReport, ReplicationStrategy, Selector};
pub use driver::{HttpDriver, HttpDriverFactory, MemoryDriver, Point, TimeRange, TsdbDriver};
pub use error::{ReplicationError, Result};
pub use monitor::{NodeHealth, NodeMonitor, ProbeResult};
pub use release::ReleaseInfo;
