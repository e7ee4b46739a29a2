// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster coordinator.
//!
//! Owns the master and slave [`NodeMonitor`]s and ties together:
//! - Bootstrap discovery via [`Bootstrap`]
//! - The one-shot initial [`ReplicationStrategy`]
//! - The supervisor loop that compares the pair and repairs divergence
//! - Ad-hoc range copies
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    ClusterCoordinator                      │
//! │                                                            │
//! │  ┌──────────────┐   snapshot()   ┌──────────────────────┐  │
//! │  │ NodeMonitor  │───────────────►│                      │  │
//! │  │ (master)     │                │  Supervisor          │  │
//! │  └──────────────┘                │  (compare + repair)  │  │
//! │  ┌──────────────┐   snapshot()   │                      │  │
//! │  │ NodeMonitor  │───────────────►│                      │  │
//! │  │ (slave)      │                └──────────┬───────────┘  │
//! │  └──────────────┘                           │              │
//! │                                   ClusterState (watch)     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The monitors are the only writers of node health; the supervisor is the
//! only writer of [`ClusterState`] and the bookkeeping timestamps.

mod bootstrap;
mod strategy;
mod supervisor;
mod types;

pub use bootstrap::{Bootstrap, BootstrapStep};
pub use strategy::{
    backfill, copy_range, fetch_schema, replicate_schema, CopySettings, DataReport, SchemaReport,
    Selector, SelectorItem,
};
pub use supervisor::EntryLag;
pub use types::{derive_state, ClusterState, ClusterStatus, CycleReport, ReplicationStrategy};

use crate::clock::{unix_nanos, Clock};
use crate::config::AgentConfig;
use crate::driver::{SchemaEntry, TimeRange, TsdbDriver};
use crate::error::Result;
use crate::metrics;
use crate::monitor::NodeMonitor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// What the initial strategy did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyReport {
    pub strategy: ReplicationStrategy,
    pub schema: SchemaReport,
    pub data: DataReport,
}

/// Supervisor-owned fields, read concurrently by status queries.
#[derive(Debug, Default)]
struct Bookkeeping {
    last_master_ok: Option<SystemTime>,
    last_slave_ok: Option<SystemTime>,
    /// Set while a node is down: last instant both were seen up.
    recovery_from: Option<SystemTime>,
    last_cycle: Option<CycleReport>,
}

/// Coordinator of one master/slave pair.
///
/// Built by [`Bootstrap`] once both nodes are configured and alive; a reload
/// drops it and bootstraps a new one.
pub struct ClusterCoordinator<D: TsdbDriver> {
    config: AgentConfig,
    master: Arc<NodeMonitor<D>>,
    slave: Arc<NodeMonitor<D>>,
    clock: Arc<dyn Clock>,
    /// Supervisor cycle interval.
    check_interval: Duration,
    state_tx: watch::Sender<ClusterState>,
    book: Mutex<Bookkeeping>,
}

impl<D: TsdbDriver> ClusterCoordinator<D> {
    /// Create a coordinator over two probed monitors, in `Healthy` state.
    pub fn new(
        config: AgentConfig,
        master: Arc<NodeMonitor<D>>,
        slave: Arc<NodeMonitor<D>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let check_interval = config.general.min_sync_interval_duration();
        let (state_tx, _) = watch::channel(ClusterState::Healthy);
        let book = Bookkeeping {
            last_master_ok: master.snapshot().last_ok,
            last_slave_ok: slave.snapshot().last_ok,
            ..Default::default()
        };
        metrics::set_cluster_state("Healthy");

        Self {
            config,
            master,
            slave,
            clock,
            check_interval,
            state_tx,
            book: Mutex::new(book),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn master(&self) -> &Arc<NodeMonitor<D>> {
        &self.master
    }

    pub fn slave(&self) -> &Arc<NodeMonitor<D>> {
        &self.slave
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Get current cluster state.
    pub fn state(&self) -> ClusterState {
        *self.state_tx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ClusterState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of state, node health and bookkeeping. No network I/O.
    pub fn status(&self) -> ClusterStatus {
        let book = self.book();
        ClusterStatus {
            state: self.state(),
            master: self.master.snapshot(),
            slave: self.slave.snapshot(),
            last_master_ok: book.last_master_ok,
            last_slave_ok: book.last_slave_ok,
            last_cycle: book.last_cycle.clone(),
        }
    }

    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ClusterState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Cluster state changed");
            metrics::record_cluster_transition(&previous.to_string(), &next.to_string());
            metrics::set_cluster_state(&next.to_string());
        }
    }

    fn copy_settings(&self) -> CopySettings {
        CopySettings::from_config(&self.config.general)
    }

    /// Run the configured one-shot strategy.
    ///
    /// An unknown strategy token is returned as a configuration error; the
    /// caller logs it and carries on with monitoring.
    pub async fn run_initial_replication(
        &self,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<StrategyReport> {
        let strategy: ReplicationStrategy = self.config.general.initial_replication.parse()?;
        let mut report = StrategyReport {
            strategy,
            ..Default::default()
        };
        if strategy == ReplicationStrategy::None {
            info!("Initial replication disabled");
            return Ok(report);
        }

        info!(strategy = %strategy, "Running initial replication");
        let snapshot = fetch_schema(&self.master, &Selector::All).await?;

        if strategy.includes_schema() {
            report.schema = replicate_schema(&self.slave, &snapshot).await?;
            info!(
                databases = report.schema.databases_created,
                retention_policies = report.schema.retention_policies_created,
                measurements = report.schema.measurements_created,
                "Initial schema replication done"
            );
        }

        if strategy.includes_data() {
            // Full history by default; an explicit window caps the start.
            let floor = self
                .config
                .general
                .full_backfill_window_duration()
                .map(|cap| unix_nanos(self.clock.now()).saturating_sub(duration_nanos(cap)));
            let mut jobs = Vec::new();
            for entry in snapshot.entries() {
                if let Some(range) = self.history_range(&entry, floor).await? {
                    jobs.push((entry, range));
                }
            }
            report.data = backfill(
                &self.master,
                &self.slave,
                &jobs,
                self.copy_settings(),
                shutdown_rx,
                "initial",
            )
            .await?;
            info!(
                descriptors = report.data.descriptors,
                points = report.data.points_copied,
                interrupted = report.data.interrupted,
                "Initial data replication done"
            );
        }
        Ok(report)
    }

    /// `[first, last]` of a master descriptor, starting no earlier than `floor`.
    async fn history_range(&self, entry: &SchemaEntry, floor: Option<i64>) -> Result<Option<TimeRange>> {
        let driver = self.master.driver();
        let (db, rp, m) = (&entry.database, &entry.retention_policy, &entry.measurement);
        let first = self
            .master
            .call("first_point_time", driver.first_point_time(db, rp, m))
            .await?;
        let last = self
            .master
            .call("last_point_time", driver.last_point_time(db, rp, m))
            .await?;
        Ok(match (first, last) {
            (Some(first), Some(last)) => {
                let start = floor.map_or(first, |f| first.max(f));
                let range = TimeRange::new(start, last.saturating_add(1));
                (!range.is_empty()).then_some(range)
            }
            _ => None,
        })
    }

    /// Ensure schema, then copy `range` for every descriptor matching `selector`.
    pub async fn copy(
        &self,
        selector: &Selector,
        range: TimeRange,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<DataReport> {
        info!(?selector, start = range.start, end = range.end, "Copying range");
        let snapshot = fetch_schema(&self.master, selector).await?;
        let schema = replicate_schema(&self.slave, &snapshot).await?;
        if schema.total() > 0 {
            info!(created = schema.total(), "Schema objects created before copy");
        }
        let jobs: Vec<_> = snapshot
            .entries()
            .into_iter()
            .map(|entry| (entry, range))
            .collect();
        let report = backfill(
            &self.master,
            &self.slave,
            &jobs,
            self.copy_settings(),
            shutdown_rx,
            "copy",
        )
        .await;
        if let Err(e) = &report {
            error!(error = %e, "Copy failed");
            metrics::record_error(e.kind());
        }
        report
    }

    /// Run the supervisor loop until shutdown is signaled.
    ///
    /// Sleeps one interval before the first cycle: bootstrap has just probed
    /// both nodes.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("supervisor");

        async move {
            let _ = shutdown_rx.borrow_and_update();
            info!(
                interval_ms = self.check_interval.as_millis() as u64,
                master = %self.master.name(),
                slave = %self.slave.name(),
                "Starting supervisor"
            );

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping supervisor");
                            break;
                        }
                        continue;
                    }

                    _ = self.clock.sleep(self.check_interval) => {}
                }

                let report = self.run_cycle(&shutdown_rx).await;
                if let Some(e) = &report.error {
                    warn!(error = %e, "Supervisor cycle failed, retrying next interval");
                }
            }

            info!("Supervisor stopped");
        }
        .instrument(span)
        .await
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NodeRole;
    use crate::driver::{MemoryDriver, Point};

    struct Pair {
        master: Arc<MemoryDriver>,
        slave: Arc<MemoryDriver>,
        clock: Arc<ManualClock>,
        coordinator: ClusterCoordinator<MemoryDriver>,
    }

    fn pair(strategy: &str) -> Pair {
        let mut config = AgentConfig::for_testing("m", "s");
        config.general.initial_replication = strategy.to_string();
        pair_with(config)
    }

    fn pair_with(config: AgentConfig) -> Pair {
        let clock = Arc::new(ManualClock::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let master = Arc::new(MemoryDriver::new("m"));
        let slave = Arc::new(MemoryDriver::new("s"));
        let monitor = |driver: &Arc<MemoryDriver>, role| {
            Arc::new(NodeMonitor::new(
                config.node(driver.name()).cloned().unwrap(),
                role,
                Arc::clone(driver),
                Arc::clone(&dyn_clock),
                Duration::from_secs(10),
                3,
            ))
        };
        let m = monitor(&master, NodeRole::Master);
        let s = monitor(&slave, NodeRole::Slave);
        let coordinator = ClusterCoordinator::new(config, m, s, dyn_clock);
        Pair {
            master,
            slave,
            clock,
            coordinator,
        }
    }

    const DAY: i64 = 24 * 3600 * 1_000_000_000;

    /// One point per day, the newest one day before `clock_now`.
    fn daily_points(clock_now: i64, days: i64) -> Vec<Point> {
        (0..days)
            .map(|i| Point::new("cpu", clock_now - (days - i) * DAY).field("v", i as f64))
            .collect()
    }

    #[test]
    fn test_new_coordinator_is_healthy() {
        let p = pair("none");
        assert_eq!(p.coordinator.state(), ClusterState::Healthy);
        assert_eq!(p.coordinator.check_interval(), Duration::from_secs(20));
        let status = p.coordinator.status();
        assert!(status.last_cycle.is_none());
        assert!(status.master.is_up());
    }

    #[tokio::test]
    async fn test_initial_none_is_noop() {
        let p = pair("none");
        p.master.seed("db", "autogen", [Point::new("cpu", 1).field("v", 1.0)]);
        let (_tx, rx) = watch::channel(false);
        let report = p.coordinator.run_initial_replication(&rx).await.unwrap();
        assert_eq!(report.strategy, ReplicationStrategy::None);
        assert!(!p.slave.has_database("db"));
    }

    #[tokio::test]
    async fn test_initial_unknown_strategy_is_config_error() {
        let p = pair("mirror");
        let (_tx, rx) = watch::channel(false);
        let err = p.coordinator.run_initial_replication(&rx).await.unwrap_err();
        assert!(matches!(err, crate::error::ReplicationError::Config(_)));
    }

    #[tokio::test]
    async fn test_initial_both_copies_full_history() {
        let p = pair("both");
        let now = unix_nanos(p.clock.now());
        p.master.seed("db", "autogen", daily_points(now, 100));

        let (_tx, rx) = watch::channel(false);
        let report = p.coordinator.run_initial_replication(&rx).await.unwrap();
        assert_eq!(report.schema.databases_created, 1);
        assert_eq!(report.data.points_copied, 100);
        assert_eq!(
            p.slave.points("db", "autogen", "cpu"),
            p.master.points("db", "autogen", "cpu")
        );

        // Nothing left for the supervisor to find.
        let report = p.coordinator.run_cycle(&rx).await;
        assert_eq!(report.state, ClusterState::Healthy);
        assert_eq!(report.points_copied, 0);
    }

    #[tokio::test]
    async fn test_initial_data_honours_explicit_backfill_cap() {
        let mut config = AgentConfig::for_testing("m", "s");
        config.general.initial_replication = "both".to_string();
        config.general.full_backfill_window = "30d".to_string();
        let p = pair_with(config);
        let now = unix_nanos(p.clock.now());
        p.master.seed("db", "autogen", daily_points(now, 100));

        let (_tx, rx) = watch::channel(false);
        let report = p.coordinator.run_initial_replication(&rx).await.unwrap();
        assert_eq!(report.data.points_copied, 30);
        assert_eq!(p.slave.point_count("db", "autogen", "cpu"), 30);
    }

    #[tokio::test]
    async fn test_last_ok_comes_from_monitor_checks() {
        let p = pair("none");
        let (_tx, rx) = watch::channel(false);
        p.coordinator.master().check().await;
        p.coordinator.slave().check().await;
        let last_good = p.clock.now();

        // One failed probe: still up, but not OK at this instant.
        p.clock.advance(Duration::from_secs(60));
        p.slave.set_reachable(false);
        p.coordinator.master().check().await;
        p.coordinator.slave().check().await;
        assert!(p.coordinator.slave().is_up());
        p.coordinator.run_cycle(&rx).await;
        assert_eq!(p.coordinator.status().last_slave_ok, Some(last_good));
        assert_eq!(p.coordinator.status().last_master_ok, Some(p.clock.now()));

        p.clock.advance(Duration::from_secs(60));
        p.coordinator.slave().check().await;
        p.coordinator.slave().check().await;
        let report = p.coordinator.run_cycle(&rx).await;
        assert_eq!(report.state, ClusterState::SlaveDown);
        assert_eq!(p.coordinator.recovery_pending_since(), Some(last_good));
    }

    #[tokio::test]
    async fn test_copy_with_selector() {
        let p = pair("none");
        p.master.seed("db", "autogen", [Point::new("cpu", 5).field("v", 1.0)]);
        p.master.seed("db", "autogen", [Point::new("mem", 5).field("v", 1.0)]);
        p.master.seed("other", "autogen", [Point::new("cpu", 5).field("v", 1.0)]);

        let (_tx, rx) = watch::channel(false);
        let selector: Selector = "db.cpu".parse().unwrap();
        let report = p
            .coordinator
            .copy(&selector, TimeRange::new(0, 10), &rx)
            .await
            .unwrap();

        assert_eq!(report.points_copied, 1);
        assert_eq!(p.slave.point_count("db", "autogen", "cpu"), 1);
        assert_eq!(p.slave.point_count("db", "autogen", "mem"), 0);
        assert!(!p.slave.has_database("other"));
    }
}
