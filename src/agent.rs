// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent lifecycle controller.
//!
//! Owns the current [`ClusterCoordinator`] and its tasks:
//!
//! ```text
//! start()  : bootstrap → initial strategy → spawn { master monitor,
//!                                                  slave monitor,
//!                                                  supervisor }
//! stop()   : signal shutdown → wait until every task has exited
//! reload() : stop() → start() under the same guard
//! ```
//!
//! Start, stop and reload serialize on one lifecycle guard, so two
//! coordinators never run at the same time. Stop signals shutdown before
//! taking the guard, which also cancels a start still waiting in bootstrap.
//! Every stop bumps a stop epoch; a start that was issued before the latest
//! stop fails with [`ReplicationError::Shutdown`] instead of running.
//!
//! # Example
//!
//! ```rust,no_run
//! use ha_replicator::agent::Agent;
//! use ha_replicator::config::FileConfigSource;
//! use ha_replicator::driver::HttpDriverFactory;
//!
//! # async fn example() -> ha_replicator::Result<()> {
//! let agent = Agent::new(FileConfigSource::new("agent.yaml"), HttpDriverFactory);
//! agent.start().await?;
//! println!("{}", agent.release_info());
//!
//! let waited = agent.stop().await?;
//! println!("stopped after {:?}", waited);
//! # Ok(())
//! # }
//! ```

use crate::clock::{unix_nanos, Clock, TokioClock};
use crate::config::{ConfigSource, GeneralConfig};
use crate::coordinator::{
    Bootstrap, ClusterCoordinator, ClusterState, ClusterStatus, DataReport, Selector,
};
use crate::driver::{DriverFactory, TimeRange, TsdbDriver};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::release::ReleaseInfo;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// A started coordinator and the tasks serving it.
struct Running<D: TsdbDriver> {
    coordinator: Arc<ClusterCoordinator<D>>,
    tasks: TaskTracker,
}

/// Shutdown channel of the current run plus the stop epoch.
struct StopSignal {
    epoch: u64,
    tx: watch::Sender<bool>,
}

/// Top-level entry point: start, stop, reload, copy.
pub struct Agent<D: TsdbDriver> {
    source: Arc<dyn ConfigSource>,
    factory: Arc<dyn DriverFactory<D>>,
    clock: Arc<dyn Clock>,
    signal: StdMutex<StopSignal>,
    /// Lifecycle guard.
    lifecycle: Mutex<Option<Running<D>>>,
    /// Current coordinator, readable without the guard.
    current: RwLock<Option<Arc<ClusterCoordinator<D>>>>,
}

impl<D: TsdbDriver> Agent<D> {
    pub fn new(source: impl ConfigSource, factory: impl DriverFactory<D>) -> Self {
        Self::with_clock(source, factory, Arc::new(TokioClock))
    }

    /// Use an injected clock for bootstrap, monitors and supervisor.
    pub fn with_clock(
        source: impl ConfigSource,
        factory: impl DriverFactory<D>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            source: Arc::new(source),
            factory: Arc::new(factory),
            clock,
            signal: StdMutex::new(StopSignal { epoch: 0, tx }),
            lifecycle: Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    /// The running coordinator, if any.
    pub fn coordinator(&self) -> Option<Arc<ClusterCoordinator<D>>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_coordinator(&self, coordinator: Option<Arc<ClusterCoordinator<D>>>) {
        match self.current.write() {
            Ok(mut guard) => *guard = coordinator,
            Err(poisoned) => *poisoned.into_inner() = coordinator,
        }
    }

    fn signal(&self) -> MutexGuard<'_, StopSignal> {
        match self.signal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fire the current shutdown channel and open a new stop epoch.
    fn signal_stop(&self) -> u64 {
        let mut signal = self.signal();
        signal.epoch += 1;
        signal.tx.send_replace(true);
        signal.epoch
    }

    /// Fresh shutdown channel for a run, unless a stop came after `epoch`.
    fn arm(&self, epoch: u64) -> Result<watch::Receiver<bool>> {
        let mut signal = self.signal();
        if signal.epoch != epoch {
            return Err(ReplicationError::Shutdown);
        }
        let (tx, rx) = watch::channel(false);
        signal.tx = tx;
        Ok(rx)
    }

    /// `Bootstrapping` while no coordinator runs.
    pub fn state(&self) -> ClusterState {
        self.coordinator()
            .map(|c| c.state())
            .unwrap_or(ClusterState::Bootstrapping)
    }

    pub fn status(&self) -> Option<ClusterStatus> {
        self.coordinator().map(|c| c.status())
    }

    pub fn is_running(&self) -> bool {
        self.coordinator().is_some()
    }

    /// Bootstrap, run the initial strategy, then launch the monitors and
    /// the supervisor.
    ///
    /// Blocks until both nodes are configured and alive. Fails with
    /// [`ReplicationError::Shutdown`] if `stop()` is called meanwhile.
    pub async fn start(&self) -> Result<()> {
        let epoch = self.signal().epoch;
        let mut running = self.lifecycle.lock().await;
        self.start_locked(&mut running, epoch).await
    }

    async fn start_locked(&self, running: &mut Option<Running<D>>, epoch: u64) -> Result<()> {
        if running.is_some() {
            return Err(ReplicationError::InvalidState {
                expected: "stopped".to_string(),
                actual: "running".to_string(),
            });
        }
        let started = Instant::now();
        let shutdown_rx = self.arm(epoch)?;

        info!("Starting agent");
        let mut bootstrap = Bootstrap::new(
            Arc::clone(&self.source),
            Arc::clone(&self.factory),
            Arc::clone(&self.clock),
        );
        let coordinator = Arc::new(bootstrap.run(shutdown_rx.clone()).await?);
        self.set_coordinator(Some(Arc::clone(&coordinator)));

        match coordinator.run_initial_replication(&shutdown_rx).await {
            Ok(report) => info!(
                strategy = %report.strategy,
                schema_created = report.schema.total(),
                points = report.data.points_copied,
                "Initial replication complete"
            ),
            Err(e) => {
                metrics::record_error(e.kind());
                error!(error = %e, "Initial replication failed, continuing with monitoring");
            }
        }
        if *shutdown_rx.borrow() {
            self.set_coordinator(None);
            return Err(ReplicationError::Shutdown);
        }

        let tasks = TaskTracker::new();
        tasks.spawn(Arc::clone(coordinator.master()).run(shutdown_rx.clone()));
        tasks.spawn(Arc::clone(coordinator.slave()).run(shutdown_rx.clone()));
        tasks.spawn(Arc::clone(&coordinator).run(shutdown_rx));
        tasks.close();

        info!(
            master = %coordinator.master().name(),
            slave = %coordinator.slave().name(),
            tasks = tasks.len(),
            "Agent running"
        );
        *running = Some(Running { coordinator, tasks });
        metrics::record_lifecycle("start", started.elapsed());
        Ok(())
    }

    /// Signal every task to finish its current unit of work and exit, then
    /// wait for all of them. Returns the time spent waiting.
    ///
    /// Safe to call when nothing runs.
    pub async fn stop(&self) -> Result<Duration> {
        let started = Instant::now();
        self.signal_stop();
        let mut running = self.lifecycle.lock().await;
        self.stop_locked(&mut running).await;
        let waited = started.elapsed();
        metrics::record_lifecycle("stop", waited);
        Ok(waited)
    }

    async fn stop_locked(&self, running: &mut Option<Running<D>>) {
        if let Some(current) = running.take() {
            info!(tasks = current.tasks.len(), "Waiting for tasks to exit");
            current.tasks.close();
            current.tasks.wait().await;
            info!(final_state = %current.coordinator.state(), "Agent stopped");
        }
        self.set_coordinator(None);
    }

    /// Stop, re-read configuration, start again.
    ///
    /// Returns the time spent waiting for the old tasks.
    pub async fn reload(&self) -> Result<Duration> {
        let started = Instant::now();
        let epoch = self.signal_stop();
        let mut running = self.lifecycle.lock().await;
        self.stop_locked(&mut running).await;
        let waited = started.elapsed();

        info!(waited_ms = waited.as_millis() as u64, "Reloading configuration");
        self.start_locked(&mut running, epoch).await?;
        metrics::record_lifecycle("reload", started.elapsed());
        Ok(waited)
    }

    /// One-shot copy of `[start, end)` for the databases in `selector`.
    ///
    /// Bootstraps its own coordinator and does not start monitoring.
    pub async fn copy(&self, selector: &str, start: SystemTime, end: SystemTime) -> Result<DataReport> {
        let selector: Selector = selector.parse()?;
        let range = TimeRange::new(unix_nanos(start), unix_nanos(end));
        if range.is_empty() {
            return Err(ReplicationError::Config(format!(
                "empty copy range: start {} >= end {}",
                range.start, range.end
            )));
        }

        let started = Instant::now();
        // Independent of the agent shutdown signal: a copy runs to completion.
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut bootstrap = Bootstrap::new(
            Arc::clone(&self.source),
            Arc::clone(&self.factory),
            Arc::clone(&self.clock),
        );
        let coordinator = bootstrap.run(cancel_rx.clone()).await?;
        let report = coordinator.copy(&selector, range, &cancel_rx).await?;
        info!(
            descriptors = report.descriptors,
            points = report.points_copied,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Copy complete"
        );
        metrics::record_lifecycle("copy", started.elapsed());
        Ok(report)
    }

    /// Build identification plus the configured instance id.
    pub fn release_info(&self) -> ReleaseInfo {
        let instance_id = match self.coordinator() {
            Some(c) => c.config().general.instance_id.clone(),
            None => self
                .source
                .load()
                .map(|c| c.general.instance_id)
                .unwrap_or_else(|_| GeneralConfig::default().instance_id),
        };
        ReleaseInfo::current(instance_id)
    }
}
