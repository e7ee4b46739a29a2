// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory driver.
//!
//! A complete [`TsdbDriver`] backed by ordered maps, with switches to make
//! the node unreachable, fail writes or slow them down. Used by the test
//! suites and for dry runs of a configuration without real databases.

use super::{BoxFuture, DriverError, DriverResult, Point, RetentionPolicy, TimeRange, TsdbDriver};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type SeriesKey = (i64, BTreeMap<String, String>);
type Series = BTreeMap<SeriesKey, Point>;

#[derive(Debug, Default)]
struct DatabaseStore {
    policies: BTreeMap<String, RetentionPolicy>,
    /// rp -> measurement -> points
    data: BTreeMap<String, BTreeMap<String, Series>>,
}

/// In-memory time-series node.
#[derive(Debug)]
pub struct MemoryDriver {
    name: String,
    databases: Mutex<BTreeMap<String, DatabaseStore>>,
    reachable: AtomicBool,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    ping_delay_ms: AtomicU64,
    write_attempts: AtomicUsize,
    write_calls: AtomicUsize,
    points_written: AtomicUsize,
}

impl MemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            databases: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            ping_delay_ms: AtomicU64::new(0),
            write_attempts: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            points_written: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> MutexGuard<'_, BTreeMap<String, DatabaseStore>> {
        self.databases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> DriverResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::new(format!("{}: connection refused", self.name)))
        }
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make every call fail as if the node were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Make `write_points` fail while the node stays reachable.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every `write_points` call.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every `ping` call (for timeout tests).
    pub fn set_ping_delay(&self, delay: Duration) {
        self.ping_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    /// Insert points directly, creating the database and policy if needed.
    pub fn seed(&self, db: &str, rp: &str, points: impl IntoIterator<Item = Point>) {
        let mut store = self.store();
        let database = store.entry(db.to_string()).or_insert_with(new_database);
        database
            .policies
            .entry(rp.to_string())
            .or_insert_with(|| RetentionPolicy::named(rp, "0s"));
        let measurements = database.data.entry(rp.to_string()).or_default();
        for point in points {
            let series = measurements.entry(point.measurement.clone()).or_default();
            series.insert((point.timestamp, point.tags.clone()), point);
        }
    }

    /// Stored points of one measurement, ordered by time.
    pub fn points(&self, db: &str, rp: &str, measurement: &str) -> Vec<Point> {
        self.store()
            .get(db)
            .and_then(|d| d.data.get(rp))
            .and_then(|m| m.get(measurement))
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn point_count(&self, db: &str, rp: &str, measurement: &str) -> usize {
        self.store()
            .get(db)
            .and_then(|d| d.data.get(rp))
            .and_then(|m| m.get(measurement))
            .map(|series| series.len())
            .unwrap_or(0)
    }

    pub fn has_database(&self, db: &str) -> bool {
        self.store().contains_key(db)
    }

    pub fn retention_policy(&self, db: &str, rp: &str) -> Option<RetentionPolicy> {
        self.store().get(db).and_then(|d| d.policies.get(rp).cloned())
    }

    /// Number of `write_points` calls, including rejected ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Number of `write_points` calls that reached the store.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Total points passed to successful `write_points` calls.
    pub fn points_written(&self) -> usize {
        self.points_written.load(Ordering::SeqCst)
    }
}

fn new_database() -> DatabaseStore {
    let mut db = DatabaseStore::default();
    let autogen = RetentionPolicy::autogen();
    db.policies.insert(autogen.name.clone(), autogen);
    db
}

fn database_not_found(db: &str) -> DriverError {
    DriverError::new(format!("database not found: {}", db))
}

impl TsdbDriver for MemoryDriver {
    fn ping(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let delay = self.ping_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.check_reachable()?;
            Ok("memory-1.8".to_string())
        })
    }

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.store().keys().cloned().collect())
        })
    }

    fn list_retention_policies<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<RetentionPolicy>> {
        Box::pin(async move {
            self.check_reachable()?;
            let store = self.store();
            let database = store.get(db).ok_or_else(|| database_not_found(db))?;
            Ok(database.policies.values().cloned().collect())
        })
    }

    fn list_measurements<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check_reachable()?;
            let store = self.store();
            let database = store.get(db).ok_or_else(|| database_not_found(db))?;
            let mut names: Vec<String> = database
                .data
                .values()
                .flat_map(|m| m.keys().cloned())
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            self.store().entry(db.to_string()).or_insert_with(new_database);
            Ok(())
        })
    }

    fn create_retention_policy<'a>(
        &'a self,
        db: &'a str,
        rp: &'a RetentionPolicy,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            let mut store = self.store();
            let database = store.get_mut(db).ok_or_else(|| database_not_found(db))?;
            database
                .policies
                .entry(rp.name.clone())
                .or_insert_with(|| rp.clone());
            Ok(())
        })
    }

    fn create_measurement<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            let mut store = self.store();
            let database = store.get_mut(db).ok_or_else(|| database_not_found(db))?;
            if !database.policies.contains_key(rp) {
                return Err(DriverError::new(format!("retention policy not found: {}", rp)));
            }
            database
                .data
                .entry(rp.to_string())
                .or_default()
                .entry(measurement.to_string())
                .or_default();
            Ok(())
        })
    }

    fn read_points<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
        range: TimeRange,
    ) -> BoxFuture<'a, Vec<Point>> {
        Box::pin(async move {
            self.check_reachable()?;
            let store = self.store();
            let database = store.get(db).ok_or_else(|| database_not_found(db))?;
            Ok(database
                .data
                .get(rp)
                .and_then(|m| m.get(measurement))
                .map(|series| {
                    series
                        .values()
                        .filter(|p| range.contains(p.timestamp))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn write_points<'a>(&'a self, db: &'a str, rp: &'a str, points: &'a [Point]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            let delay = self.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.check_reachable()?;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DriverError::new(format!("{}: write rejected", self.name)));
            }

            let mut store = self.store();
            let database = store.get_mut(db).ok_or_else(|| database_not_found(db))?;
            if !database.policies.contains_key(rp) {
                return Err(DriverError::new(format!("retention policy not found: {}", rp)));
            }
            let measurements = database.data.entry(rp.to_string()).or_default();
            for point in points {
                measurements
                    .entry(point.measurement.clone())
                    .or_default()
                    .insert((point.timestamp, point.tags.clone()), point.clone());
            }
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            self.points_written.fetch_add(points.len(), Ordering::SeqCst);
            Ok(())
        })
    }

    fn first_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.check_reachable()?;
            let store = self.store();
            let database = store.get(db).ok_or_else(|| database_not_found(db))?;
            Ok(database
                .data
                .get(rp)
                .and_then(|m| m.get(measurement))
                .and_then(|series| series.keys().map(|(ts, _)| *ts).min()))
        })
    }

    fn last_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.check_reachable()?;
            let store = self.store();
            let database = store.get(db).ok_or_else(|| database_not_found(db))?;
            Ok(database
                .data
                .get(rp)
                .and_then(|m| m.get(measurement))
                .and_then(|series| series.keys().map(|(ts, _)| *ts).max()))
        })
    }
}
