// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervisor: periodic comparison and repair.
//!
//! # Algorithm
//!
//! 1. Read both monitors' health snapshots
//! 2. Any node down → MasterDown / SlaveDown / BothDown, skip the cycle
//! 3. Both up → list master descriptors, read last-point timestamps on both sides
//! 4. Every descriptor present on the slave and within `sync_tolerance` → Healthy;
//!    a slave trailing inside the tolerance still gets the missing tail copied
//! 5. Otherwise → Resyncing: re-run schema replication, then copy each
//!    divergent descriptor from the slave's last point (bounded by
//!    `max_resync_window`)
//!
//! After an outage the first cycle with both nodes up also re-copies every
//! descriptor from the last instant both were seen up.
//!
//! A failing cycle is logged and skipped; the next one starts from scratch.

use super::strategy::{backfill, fetch_schema, replicate_schema, Selector};
use super::types::{derive_state, ClusterState, CycleReport};
use super::{duration_nanos, ClusterCoordinator};
use crate::clock::unix_nanos;
use crate::driver::{SchemaEntry, SchemaSnapshot, TimeRange, TsdbDriver};
use crate::error::Result;
use crate::metrics;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Master/slave comparison of one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLag {
    pub entry: SchemaEntry,
    pub master_last: Option<i64>,
    pub slave_last: Option<i64>,
    /// Database, policy and measurement all exist on the slave.
    pub on_slave: bool,
}

impl EntryLag {
    /// How far the slave trails the master.
    ///
    /// Zero when it does not trail, or when either side has no points.
    pub fn lag(&self) -> Duration {
        match (self.master_last, self.slave_last) {
            (Some(m), Some(s)) if m > s => Duration::from_nanos(m.abs_diff(s)),
            _ => Duration::ZERO,
        }
    }

    /// Missing on the slave, or trailing by more than `tolerance`.
    pub fn is_divergent(&self, tolerance: Duration) -> bool {
        if !self.on_slave {
            return true;
        }
        match (self.master_last, self.slave_last) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(m), Some(s)) => m > s && u128::from(m.abs_diff(s)) > tolerance.as_nanos(),
        }
    }

    /// Incremental range that brings the slave up to the master's last point.
    ///
    /// Starts at the slave's last point, never further back than `window`.
    pub fn resync_range(&self, tolerance: Duration, window: Duration) -> Option<TimeRange> {
        let master_last = self.master_last?;
        if !self.is_divergent(tolerance) {
            return None;
        }
        let floor = master_last.saturating_sub(duration_nanos(window));
        let start = self.slave_last.map_or(floor, |s| s.max(floor));
        Some(TimeRange::new(start, master_last.saturating_add(1)))
    }

    /// Points the slave is missing at the end of a descriptor it already
    /// has, whether or not the gap exceeds the tolerance.
    pub fn tail_range(&self, window: Duration) -> Option<TimeRange> {
        match (self.on_slave, self.master_last, self.slave_last) {
            (true, Some(m), Some(s)) if m > s => {
                let start = s.max(m.saturating_sub(duration_nanos(window)));
                Some(TimeRange::new(start, m.saturating_add(1)))
            }
            _ => None,
        }
    }

    /// Range to re-copy after an outage that started at `since`.
    pub fn recovery_range(&self, since: i64, window: Duration) -> Option<TimeRange> {
        let master_last = self.master_last?;
        let start = since.max(master_last.saturating_sub(duration_nanos(window)));
        let range = TimeRange::new(start, master_last.saturating_add(1));
        (!range.is_empty()).then_some(range)
    }
}

fn merge(a: Option<TimeRange>, b: Option<TimeRange>) -> Option<TimeRange> {
    match (a, b) {
        (Some(a), Some(b)) => Some(TimeRange::new(a.start.min(b.start), a.end.max(b.end))),
        (a, b) => a.or(b),
    }
}

impl<D: TsdbDriver> ClusterCoordinator<D> {
    /// Run one supervisor cycle.
    pub async fn run_cycle(&self, shutdown_rx: &watch::Receiver<bool>) -> CycleReport {
        let started = Instant::now();
        let now = self.clock.now();
        let master_up = self.master.is_up();
        let slave_up = self.slave.is_up();

        {
            // Last-OK instants are the monitors' own probe times.
            let mut book = self.book();
            if let Some(ok) = self.master.snapshot().last_ok {
                book.last_master_ok = Some(ok);
            }
            if let Some(ok) = self.slave.snapshot().last_ok {
                book.last_slave_ok = Some(ok);
            }
            if !(master_up && slave_up) && book.recovery_from.is_none() {
                let since = match (book.last_master_ok, book.last_slave_ok) {
                    (Some(m), Some(s)) => m.min(s),
                    _ => now
                        .checked_sub(self.config.general.max_resync_window_duration())
                        .unwrap_or(UNIX_EPOCH),
                };
                book.recovery_from = Some(since);
            }
        }

        let mut report = if master_up && slave_up {
            let mut report = CycleReport::new(self.state());
            if let Err(e) = self.reconcile(shutdown_rx, &mut report).await {
                metrics::record_error(e.kind());
                metrics::record_supervisor_skipped("error");
                report.error = Some(e.to_string());
            }
            report.state = self.state();
            report
        } else {
            let state = derive_state(master_up, slave_up, true);
            self.set_state(state);
            let reason = match state {
                ClusterState::MasterDown => "master_down",
                ClusterState::SlaveDown => "slave_down",
                _ => "both_down",
            };
            debug!(state = %state, "Skipping replication this cycle");
            metrics::record_supervisor_skipped(reason);
            CycleReport::new(state)
        };

        report.duration = started.elapsed();
        metrics::record_supervisor_cycle(&report.state.to_string(), report.divergent, report.duration);
        self.book().last_cycle = Some(report.clone());
        report
    }

    /// Compare the pair and repair what diverged.
    #[instrument(skip_all)]
    async fn reconcile(
        &self,
        shutdown_rx: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let general = &self.config.general;
        let tolerance = general.sync_tolerance_duration();
        let window = general.max_resync_window_duration();

        let (snapshot, lags) = self.compare().await?;
        let divergent = lags.iter().filter(|l| l.is_divergent(tolerance)).count();
        report.descriptors = lags.len();
        report.divergent = divergent;
        report.max_lag = lags.iter().map(EntryLag::lag).max().unwrap_or_default();
        metrics::record_replication_lag(report.max_lag);

        let recovery_from = self.book().recovery_from;
        if divergent == 0 && recovery_from.is_none() {
            self.set_state(ClusterState::Healthy);
            // In tolerance, but still bring trailing descriptors level.
            let tails: Vec<_> = lags
                .iter()
                .filter_map(|lag| lag.tail_range(window).map(|r| (lag.entry.clone(), r)))
                .collect();
            if !tails.is_empty() {
                let data = backfill(
                    &self.master,
                    &self.slave,
                    &tails,
                    self.copy_settings(),
                    shutdown_rx,
                    "tail",
                )
                .await?;
                report.points_copied = data.points_copied;
                report.interrupted = data.interrupted;
            }
            return Ok(());
        }
        self.set_state(derive_state(true, true, false));

        let schema = replicate_schema(&self.slave, &snapshot).await?;
        report.schema_created = schema.total();

        let since = recovery_from.map(unix_nanos);
        let jobs: Vec<_> = lags
            .iter()
            .filter_map(|lag| {
                let recovery = since.and_then(|s| lag.recovery_range(s, window));
                let incremental = merge(lag.resync_range(tolerance, window), lag.tail_range(window));
                merge(incremental, recovery).map(|r| (lag.entry.clone(), r))
            })
            .collect();

        info!(
            divergent,
            jobs = jobs.len(),
            recovering = since.is_some(),
            max_lag_ms = report.max_lag.as_millis() as u64,
            "Resyncing slave"
        );

        let data = backfill(
            &self.master,
            &self.slave,
            &jobs,
            self.copy_settings(),
            shutdown_rx,
            if since.is_some() { "recovery" } else { "resync" },
        )
        .await?;
        report.points_copied = data.points_copied;
        report.interrupted = data.interrupted;

        if !data.interrupted {
            self.book().recovery_from = None;
        }
        Ok(())
    }

    /// Master schema plus per-descriptor last-point comparison.
    async fn compare(&self) -> Result<(SchemaSnapshot, Vec<EntryLag>)> {
        let snapshot = fetch_schema(&self.master, &Selector::All).await?;
        let layout = self.slave_layout(&snapshot).await?;

        let mut lags = Vec::new();
        for entry in snapshot.entries() {
            let on_slave = layout.get(&entry.database).map_or(false, |(rps, ms)| {
                rps.contains(&entry.retention_policy) && ms.contains(&entry.measurement)
            });
            let master_last = self
                .master
                .call(
                    "last_point_time",
                    self.master.driver().last_point_time(
                        &entry.database,
                        &entry.retention_policy,
                        &entry.measurement,
                    ),
                )
                .await?;
            let slave_last = if on_slave {
                self.slave
                    .call(
                        "last_point_time",
                        self.slave.driver().last_point_time(
                            &entry.database,
                            &entry.retention_policy,
                            &entry.measurement,
                        ),
                    )
                    .await?
            } else {
                None
            };
            lags.push(EntryLag {
                entry,
                master_last,
                slave_last,
                on_slave,
            });
        }
        Ok((snapshot, lags))
    }

    /// Retention policies and measurements present on the slave, per database.
    async fn slave_layout(
        &self,
        snapshot: &SchemaSnapshot,
    ) -> Result<HashMap<String, (HashSet<String>, HashSet<String>)>> {
        let driver = self.slave.driver();
        let existing: HashSet<String> = self
            .slave
            .call("list_databases", driver.list_databases())
            .await?
            .into_iter()
            .collect();

        let mut layout = HashMap::new();
        for db in snapshot.databases.iter().filter(|d| existing.contains(&d.name)) {
            let rps = self
                .slave
                .call("list_retention_policies", driver.list_retention_policies(&db.name))
                .await?
                .into_iter()
                .map(|rp| rp.name)
                .collect();
            let measurements = self
                .slave
                .call("list_measurements", driver.list_measurements(&db.name))
                .await?
                .into_iter()
                .collect();
            layout.insert(db.name.clone(), (rps, measurements));
        }
        Ok(layout)
    }

    /// Last instant both nodes were seen up, while an outage is pending.
    pub fn recovery_pending_since(&self) -> Option<SystemTime> {
        self.book().recovery_from
    }
}
