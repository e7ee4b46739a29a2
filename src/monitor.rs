// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node liveness monitor.
//!
//! A [`NodeMonitor`] owns the connectivity state of one database node. Only
//! its own probe path writes that state; everybody else reads an immutable
//! [`NodeHealth`] copy through [`NodeMonitor::snapshot()`] or a watch
//! receiver.
//!
//! # Down Detection
//!
//! ```text
//!   probe ok ──────────────→ failures = 0, up
//!   probe failed ──────────→ failures += 1
//!   failures >= threshold ─→ down (reported, never fatal)
//! ```
//!
//! The default threshold is 3 consecutive failures. A single successful
//! probe brings the node back up.

use crate::clock::Clock;
use crate::config::{NodeConfig, NodeRole};
use crate::driver::{BoxFuture, TsdbDriver};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn, Instrument};

/// Result of a single liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub alive: bool,
    pub latency: Duration,
    /// Server version reported by a successful probe.
    pub version: Option<String>,
    pub error: Option<ReplicationError>,
}

/// Immutable copy of a node's connectivity state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    /// Last probe succeeded.
    pub alive: bool,
    /// Failure threshold reached. Cleared by the next successful probe.
    pub down: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
    pub last_ok: Option<SystemTime>,
    pub latency: Option<Duration>,
    pub version: Option<String>,
    pub last_error: Option<String>,
}

impl NodeHealth {
    /// State before the first probe: assumed up.
    fn unknown() -> Self {
        Self {
            alive: true,
            down: false,
            consecutive_failures: 0,
            last_check: None,
            last_ok: None,
            latency: None,
            version: None,
            last_error: None,
        }
    }

    pub fn is_up(&self) -> bool {
        !self.down
    }
}

/// Liveness prober for one node.
pub struct NodeMonitor<D: TsdbDriver> {
    config: NodeConfig,
    role: NodeRole,
    driver: Arc<D>,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    failure_threshold: u32,
    health_tx: watch::Sender<NodeHealth>,
}

impl<D: TsdbDriver> NodeMonitor<D> {
    pub fn new(
        config: NodeConfig,
        role: NodeRole,
        driver: Arc<D>,
        clock: Arc<dyn Clock>,
        check_interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        let (health_tx, _) = watch::channel(NodeHealth::unknown());
        Self {
            config,
            role,
            driver,
            clock,
            check_interval,
            failure_threshold: failure_threshold.max(1),
            health_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Copy of the current health state.
    pub fn snapshot(&self) -> NodeHealth {
        self.health_tx.borrow().clone()
    }

    /// Watch health changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeHealth> {
        self.health_tx.subscribe()
    }

    pub fn is_up(&self) -> bool {
        self.health_tx.borrow().is_up()
    }

    /// One liveness probe bounded by the node timeout.
    ///
    /// Never fails: an unreachable node yields `alive = false` and the error.
    pub async fn ping(&self) -> ProbeResult {
        let limit = self.config.timeout_duration();
        let started = Instant::now();
        let outcome = timeout(limit, self.driver.ping()).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(version)) => ProbeResult {
                alive: true,
                latency,
                version: Some(version),
                error: None,
            },
            Ok(Err(e)) => ProbeResult {
                alive: false,
                latency,
                version: None,
                error: Some(ReplicationError::connectivity(self.name(), e.to_string())),
            },
            Err(_) => ProbeResult {
                alive: false,
                latency,
                version: None,
                error: Some(ReplicationError::Timeout {
                    node: self.name().to_string(),
                    timeout: limit,
                }),
            },
        }
    }

    /// Probe once and fold the result into the health state.
    pub async fn check(&self) -> NodeHealth {
        let probe = self.ping().await;
        self.record(&probe)
    }

    fn record(&self, probe: &ProbeResult) -> NodeHealth {
        let now = self.clock.now();
        let role = self.role.to_string();
        metrics::record_node_probe(self.name(), &role, probe.alive, probe.latency);

        let previous = self.snapshot();
        let mut health = previous.clone();
        health.alive = probe.alive;
        health.last_check = Some(now);
        health.latency = Some(probe.latency);
        if probe.alive {
            health.consecutive_failures = 0;
            health.last_ok = Some(now);
            health.version = probe.version.clone();
            health.last_error = None;
        } else {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_error = probe.error.as_ref().map(|e| e.to_string());
        }
        health.down = health.consecutive_failures >= self.failure_threshold;

        if health.down && !previous.down {
            warn!(
                node = %self.name(),
                role = %role,
                failures = health.consecutive_failures,
                error = health.last_error.as_deref().unwrap_or(""),
                "Node down"
            );
        } else if !health.down && previous.down {
            info!(node = %self.name(), role = %role, "Node back up");
        } else if !probe.alive {
            debug!(
                node = %self.name(),
                failures = health.consecutive_failures,
                error = health.last_error.as_deref().unwrap_or(""),
                "Probe failed"
            );
        }

        metrics::set_node_up(self.name(), &role, health.is_up());
        metrics::set_node_consecutive_failures(self.name(), health.consecutive_failures);
        self.health_tx.send_replace(health.clone());
        health
    }

    /// Probe every `check_interval` until shutdown is signaled.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("node_monitor", node = %self.name(), role = %self.role);

        async move {
            let _ = shutdown_rx.borrow_and_update();
            info!(interval_ms = self.check_interval.as_millis() as u64, "Starting node monitor");

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }

                    _ = self.clock.sleep(self.check_interval) => {}
                }

                self.check().await;
            }

            info!("Node monitor stopped");
        }
        .instrument(span)
        .await
    }

    /// Run a driver call, attaching node and operation to its error.
    pub async fn call<'a, T>(&self, operation: &str, call: BoxFuture<'a, T>) -> Result<T> {
        call.await
            .map_err(|e| ReplicationError::driver(self.name(), operation, e))
    }
}
