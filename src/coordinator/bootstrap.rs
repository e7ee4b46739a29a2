// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrap: wait until the pair exists and answers.
//!
//! Each attempt re-reads the configuration, looks up the master and slave
//! entries, connects a driver to each and probes both once:
//!
//! ```text
//! load config ──(error / entry missing)──→ Waiting
//!      │
//! connect + probe ──(a node not alive)───→ Waiting
//!      │
//!      └──────────────────────────────────→ Ready(ClusterCoordinator)
//! ```
//!
//! [`Bootstrap::run`] repeats attempts, sleeping `monitor_retry_interval`
//! on the injected clock in between, until one is ready or shutdown is
//! signaled. Retries are unbounded.

use super::ClusterCoordinator;
use crate::clock::Clock;
use crate::config::{AgentConfig, ConfigSource, GeneralConfig, NodeConfig, NodeRole};
use crate::driver::{DriverFactory, TsdbDriver};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::monitor::NodeMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Outcome of one bootstrap attempt.
pub enum BootstrapStep<D: TsdbDriver> {
    /// Both nodes configured and alive.
    Ready(ClusterCoordinator<D>),
    /// Not yet; the reason is logged and kept for diagnostics.
    Waiting(ReplicationError),
}

impl<D: TsdbDriver> std::fmt::Debug for BootstrapStep<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapStep::Ready(c) => f
                .debug_tuple("Ready")
                .field(&c.master().name())
                .field(&c.slave().name())
                .finish(),
            BootstrapStep::Waiting(e) => f.debug_tuple("Waiting").field(e).finish(),
        }
    }
}

/// Bootstrap state machine.
pub struct Bootstrap<D: TsdbDriver> {
    source: Arc<dyn ConfigSource>,
    factory: Arc<dyn DriverFactory<D>>,
    clock: Arc<dyn Clock>,
    attempts: u64,
    retry_interval: Duration,
}

impl<D: TsdbDriver> Bootstrap<D> {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        factory: Arc<dyn DriverFactory<D>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            factory,
            clock,
            attempts: 0,
            retry_interval: GeneralConfig::default().monitor_retry_interval_duration(),
        }
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// One pass: load, look up, connect, probe.
    pub async fn attempt(&mut self) -> BootstrapStep<D> {
        self.attempts += 1;
        match self.try_attempt().await {
            Ok(coordinator) => {
                metrics::record_bootstrap_attempt("ready");
                info!(
                    attempts = self.attempts,
                    master = %coordinator.master().name(),
                    slave = %coordinator.slave().name(),
                    "Cluster bootstrapped"
                );
                BootstrapStep::Ready(coordinator)
            }
            Err(e) => {
                metrics::record_bootstrap_attempt("waiting");
                warn!(attempt = self.attempts, error = %e, "Cluster not ready");
                BootstrapStep::Waiting(e)
            }
        }
    }

    async fn try_attempt(&mut self) -> Result<ClusterCoordinator<D>> {
        let config = self.source.load()?;
        self.retry_interval = config.general.monitor_retry_interval_duration();

        let general = &config.general;
        let master_cfg = config
            .master()
            .cloned()
            .ok_or_else(|| missing_node(&config, "master_db", &general.master_db))?;
        let slave_cfg = config
            .slave()
            .cloned()
            .ok_or_else(|| missing_node(&config, "slave_db", &general.slave_db))?;
        config.validate_topology()?;

        let master = self.monitor(master_cfg, NodeRole::Master, general)?;
        let slave = self.monitor(slave_cfg, NodeRole::Slave, general)?;

        let (master_health, slave_health) = futures::future::join(master.check(), slave.check()).await;
        for (monitor, health) in [(&master, &master_health), (&slave, &slave_health)] {
            if !health.alive {
                return Err(ReplicationError::connectivity(
                    monitor.name(),
                    health.last_error.clone().unwrap_or_else(|| "not alive".to_string()),
                ));
            }
        }

        Ok(ClusterCoordinator::new(
            config,
            master,
            slave,
            Arc::clone(&self.clock),
        ))
    }

    fn monitor(
        &self,
        node: NodeConfig,
        role: NodeRole,
        general: &GeneralConfig,
    ) -> Result<Arc<NodeMonitor<D>>> {
        let driver = self
            .factory
            .connect(&node)
            .map_err(|e| ReplicationError::connectivity(&node.name, e.to_string()))?;
        Ok(Arc::new(NodeMonitor::new(
            node,
            role,
            driver,
            Arc::clone(&self.clock),
            general.check_interval_duration(),
            general.failure_threshold,
        )))
    }

    /// Attempt until ready, sleeping between attempts.
    ///
    /// Returns [`ReplicationError::Shutdown`] if shutdown is signaled first.
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<ClusterCoordinator<D>> {
        loop {
            if *shutdown_rx.borrow_and_update() {
                return Err(ReplicationError::Shutdown);
            }
            if let BootstrapStep::Ready(coordinator) = self.attempt().await {
                return Ok(coordinator);
            }

            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!(attempts = self.attempts, "Bootstrap cancelled");
                        return Err(ReplicationError::Shutdown);
                    }
                }

                _ = self.clock.sleep(self.retry_interval) => {}
            }
        }
    }
}

fn missing_node(config: &AgentConfig, key: &str, name: &str) -> ReplicationError {
    if name.is_empty() {
        ReplicationError::Config(format!("general.{} is empty", key))
    } else {
        let known: Vec<&str> = config.nodes.iter().map(|n| n.name.as_str()).collect();
        ReplicationError::Config(format!(
            "no node named '{}' ({}); configured: [{}]",
            name,
            key,
            known.join(", ")
        ))
    }
}
