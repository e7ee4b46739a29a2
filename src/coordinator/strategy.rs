// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema and data replication primitives.
//!
//! Everything here is idempotent: creating an object that already exists is
//! skipped and writing a point again overwrites it with identical values, so
//! a failed run can simply be repeated from scratch.
//!
//! # Backfill
//!
//! ```text
//! for each descriptor (db, rp, measurement):      ← unit of work
//!     for each window of data_chunk_duration:
//!         read master → write slave in batches of max_points_per_write
//!     shutdown requested? → stop here
//! ```

use crate::config::GeneralConfig;
use crate::driver::{
    DatabaseSchema, SchemaEntry, SchemaSnapshot, TimeRange, TsdbDriver, INTERNAL_DATABASES,
};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::monitor::NodeMonitor;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Chunking parameters for data copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySettings {
    pub chunk: Duration,
    pub max_points_per_write: usize,
}

impl CopySettings {
    pub fn from_config(general: &GeneralConfig) -> Self {
        Self {
            chunk: general.data_chunk_duration(),
            max_points_per_write: general.max_points_per_write.max(1),
        }
    }
}

/// Objects created on the slave by a schema pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub databases_created: usize,
    pub retention_policies_created: usize,
    pub measurements_created: usize,
}

impl SchemaReport {
    pub fn total(&self) -> usize {
        self.databases_created + self.retention_policies_created + self.measurements_created
    }
}

/// Result of a backfill over several descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataReport {
    /// Descriptors fully copied.
    pub descriptors: usize,
    pub points_copied: usize,
    /// Stopped before the last descriptor because shutdown was requested.
    pub interrupted: bool,
}

// =============================================================================
// Selector
// =============================================================================

/// One `database` or `database.measurement` selector item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorItem {
    pub database: String,
    pub measurement: Option<String>,
}

/// Which databases/measurements an ad-hoc copy covers.
///
/// `*` (or an empty string) selects everything; otherwise a comma-separated
/// list of `database` or `database.measurement` items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Items(Vec<SelectorItem>),
}

impl Selector {
    pub fn matches_database(&self, database: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Items(items) => items.iter().any(|i| i.database == database),
        }
    }

    pub fn matches(&self, database: &str, measurement: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Items(items) => items.iter().any(|i| {
                i.database == database
                    && i.measurement.as_deref().map_or(true, |m| m == measurement)
            }),
        }
    }
}

impl FromStr for Selector {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Selector::All);
        }
        let mut items = Vec::new();
        for raw in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let item = match raw.split_once('.') {
                Some((db, m)) if !db.is_empty() && !m.is_empty() => SelectorItem {
                    database: db.to_string(),
                    measurement: Some(m.to_string()),
                },
                None => SelectorItem {
                    database: raw.to_string(),
                    measurement: None,
                },
                Some(_) => {
                    return Err(ReplicationError::Config(format!("invalid selector item '{}'", raw)))
                }
            };
            items.push(item);
        }
        if items.is_empty() {
            return Ok(Selector::All);
        }
        Ok(Selector::Items(items))
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Read the master schema, skipping internal databases.
pub async fn fetch_schema<D: TsdbDriver>(
    master: &NodeMonitor<D>,
    selector: &Selector,
) -> Result<SchemaSnapshot> {
    let driver = master.driver();
    let mut names = master.call("list_databases", driver.list_databases()).await?;
    names.retain(|db| !INTERNAL_DATABASES.contains(&db.as_str()) && selector.matches_database(db));
    names.sort();

    let mut databases = Vec::with_capacity(names.len());
    for name in names {
        let retention_policies = master
            .call("list_retention_policies", driver.list_retention_policies(&name))
            .await?;
        let mut measurements = master
            .call("list_measurements", driver.list_measurements(&name))
            .await?;
        measurements.retain(|m| selector.matches(&name, m));
        databases.push(DatabaseSchema {
            name,
            retention_policies,
            measurements,
        });
    }
    Ok(SchemaSnapshot { databases })
}

/// Create on the slave whatever the snapshot has and the slave lacks.
///
/// Order: databases, then retention policies, then measurements.
pub async fn replicate_schema<D: TsdbDriver>(
    slave: &NodeMonitor<D>,
    snapshot: &SchemaSnapshot,
) -> Result<SchemaReport> {
    let driver = slave.driver();
    let mut report = SchemaReport::default();
    let existing: HashSet<String> = slave
        .call("list_databases", driver.list_databases())
        .await?
        .into_iter()
        .collect();

    for db in &snapshot.databases {
        if !existing.contains(&db.name) {
            slave.call("create_database", driver.create_database(&db.name)).await?;
            info!(node = %slave.name(), database = %db.name, "Created database");
            report.databases_created += 1;
        }

        let policies: HashSet<String> = slave
            .call("list_retention_policies", driver.list_retention_policies(&db.name))
            .await?
            .into_iter()
            .map(|rp| rp.name)
            .collect();
        for rp in &db.retention_policies {
            if !policies.contains(&rp.name) {
                slave
                    .call("create_retention_policy", driver.create_retention_policy(&db.name, rp))
                    .await?;
                info!(node = %slave.name(), database = %db.name, rp = %rp.name, "Created retention policy");
                report.retention_policies_created += 1;
            }
        }

        let measurements: HashSet<String> = slave
            .call("list_measurements", driver.list_measurements(&db.name))
            .await?
            .into_iter()
            .collect();
        for rp in &db.retention_policies {
            for m in db.measurements.iter().filter(|m| !measurements.contains(*m)) {
                slave
                    .call("create_measurement", driver.create_measurement(&db.name, &rp.name, m))
                    .await?;
                debug!(node = %slave.name(), database = %db.name, rp = %rp.name, measurement = %m, "Created measurement");
                report.measurements_created += 1;
            }
        }
    }

    metrics::record_schema_created("database", report.databases_created);
    metrics::record_schema_created("retention_policy", report.retention_policies_created);
    metrics::record_schema_created("measurement", report.measurements_created);
    Ok(report)
}

// =============================================================================
// Data
// =============================================================================

/// Copy one descriptor's points in `range` from master to slave.
///
/// Returns the number of points written.
pub async fn copy_range<D: TsdbDriver>(
    master: &NodeMonitor<D>,
    slave: &NodeMonitor<D>,
    entry: &SchemaEntry,
    range: TimeRange,
    settings: CopySettings,
) -> Result<usize> {
    let mut copied = 0;
    for window in range.chunks(settings.chunk) {
        let points = master
            .call(
                "read_points",
                master.driver().read_points(
                    &entry.database,
                    &entry.retention_policy,
                    &entry.measurement,
                    window,
                ),
            )
            .await?;
        for batch in points.chunks(settings.max_points_per_write.max(1)) {
            slave
                .call(
                    "write_points",
                    slave
                        .driver()
                        .write_points(&entry.database, &entry.retention_policy, batch),
                )
                .await?;
            copied += batch.len();
        }
    }
    if copied > 0 {
        metrics::record_points_copied(&entry.database, copied);
    }
    Ok(copied)
}

/// Copy every job, one descriptor at a time.
///
/// Shutdown is honoured between descriptors: the descriptor in flight is
/// always finished.
pub async fn backfill<D: TsdbDriver>(
    master: &NodeMonitor<D>,
    slave: &NodeMonitor<D>,
    jobs: &[(SchemaEntry, TimeRange)],
    settings: CopySettings,
    shutdown_rx: &watch::Receiver<bool>,
    reason: &str,
) -> Result<DataReport> {
    let mut report = DataReport::default();
    for (entry, range) in jobs {
        if *shutdown_rx.borrow() {
            info!(
                reason,
                done = report.descriptors,
                remaining = jobs.len() - report.descriptors,
                "Backfill interrupted by shutdown"
            );
            report.interrupted = true;
            break;
        }
        let started = Instant::now();
        let copied = copy_range(master, slave, entry, *range, settings).await?;
        metrics::record_backfill(reason, copied, started.elapsed());
        debug!(
            reason,
            descriptor = %entry,
            start = range.start,
            end = range.end,
            points = copied,
            "Descriptor copied"
        );
        report.descriptors += 1;
        report.points_copied += copied;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{NodeConfig, NodeRole};
    use crate::driver::{MemoryDriver, Point, RetentionPolicy};
    use std::sync::Arc;

    fn monitor(driver: &Arc<MemoryDriver>, role: NodeRole) -> NodeMonitor<MemoryDriver> {
        NodeMonitor::new(
            NodeConfig::for_testing(driver.name(), "http://mem:8086"),
            role,
            Arc::clone(driver),
            Arc::new(ManualClock::default()),
            Duration::from_secs(10),
            3,
        )
    }

    fn settings() -> CopySettings {
        CopySettings {
            chunk: Duration::from_nanos(25),
            max_points_per_write: 4,
        }
    }

    fn entry(db: &str, rp: &str, m: &str) -> SchemaEntry {
        SchemaEntry {
            database: db.to_string(),
            retention_policy: rp.to_string(),
            measurement: m.to_string(),
        }
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("*".parse::<Selector>().unwrap(), Selector::All);
        assert_eq!("".parse::<Selector>().unwrap(), Selector::All);

        let sel: Selector = "telegraf, metrics.cpu".parse().unwrap();
        assert!(sel.matches_database("telegraf"));
        assert!(sel.matches_database("metrics"));
        assert!(!sel.matches_database("other"));
        assert!(sel.matches("telegraf", "anything"));
        assert!(sel.matches("metrics", "cpu"));
        assert!(!sel.matches("metrics", "mem"));

        assert!(".cpu".parse::<Selector>().is_err());
    }

    #[tokio::test]
    async fn test_fetch_schema_skips_internal() {
        let master = Arc::new(MemoryDriver::new("m"));
        master.seed("_internal", "monitor", [Point::new("runtime", 1).field("v", 1.0)]);
        master.seed("telegraf", "autogen", [Point::new("cpu", 1).field("v", 1.0)]);

        let snapshot = fetch_schema(&monitor(&master, NodeRole::Master), &Selector::All)
            .await
            .unwrap();
        assert_eq!(snapshot.databases.len(), 1);
        assert_eq!(snapshot.databases[0].name, "telegraf");
        assert_eq!(snapshot.databases[0].measurements, vec!["cpu".to_string()]);
    }

    #[tokio::test]
    async fn test_replicate_schema_creates_missing_only() {
        let master = Arc::new(MemoryDriver::new("m"));
        master.seed("telegraf", "autogen", [Point::new("cpu", 1).field("v", 1.0)]);
        master.seed("telegraf", "week", [Point::new("mem", 1).field("v", 1.0)]);
        let slave = Arc::new(MemoryDriver::new("s"));
        slave.create_database("telegraf").await.unwrap();
        slave
            .create_retention_policy("telegraf", &RetentionPolicy::named("week", "999h"))
            .await
            .unwrap();

        let m = monitor(&master, NodeRole::Master);
        let s = monitor(&slave, NodeRole::Slave);
        let snapshot = fetch_schema(&m, &Selector::All).await.unwrap();
        let report = replicate_schema(&s, &snapshot).await.unwrap();

        assert_eq!(report.databases_created, 0);
        assert_eq!(report.retention_policies_created, 0);
        assert_eq!(report.measurements_created, 4);
        // Existing policy untouched.
        assert_eq!(slave.retention_policy("telegraf", "week").unwrap().duration, "999h");

        let again = replicate_schema(&s, &snapshot).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_copy_range_chunks_and_batches() {
        let master = Arc::new(MemoryDriver::new("m"));
        master.seed(
            "db",
            "autogen",
            (0..100).map(|i| Point::new("cpu", i).field("v", i as f64)),
        );
        let slave = Arc::new(MemoryDriver::new("s"));
        slave.create_database("db").await.unwrap();

        let copied = copy_range(
            &monitor(&master, NodeRole::Master),
            &monitor(&slave, NodeRole::Slave),
            &entry("db", "autogen", "cpu"),
            TimeRange::new(0, 100),
            settings(),
        )
        .await
        .unwrap();

        assert_eq!(copied, 100);
        assert_eq!(slave.point_count("db", "autogen", "cpu"), 100);
        // 4 windows of 25 points, each split into batches of at most 4.
        assert_eq!(slave.write_calls(), 4 * 7);
    }

    #[tokio::test]
    async fn test_copy_range_write_failure_is_driver_error() {
        let master = Arc::new(MemoryDriver::new("m"));
        master.seed("db", "autogen", [Point::new("cpu", 1).field("v", 1.0)]);
        let slave = Arc::new(MemoryDriver::new("s"));
        slave.create_database("db").await.unwrap();
        slave.set_fail_writes(true);

        let err = copy_range(
            &monitor(&master, NodeRole::Master),
            &monitor(&slave, NodeRole::Slave),
            &entry("db", "autogen", "cpu"),
            TimeRange::new(0, 10),
            settings(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Driver { ref operation, .. } if operation == "write_points"));
    }

    #[tokio::test]
    async fn test_backfill_stops_between_descriptors() {
        let master = Arc::new(MemoryDriver::new("m"));
        master.seed("db", "autogen", [Point::new("cpu", 1).field("v", 1.0)]);
        master.seed("db", "autogen", [Point::new("mem", 1).field("v", 1.0)]);
        let slave = Arc::new(MemoryDriver::new("s"));
        slave.create_database("db").await.unwrap();

        let jobs = vec![
            (entry("db", "autogen", "cpu"), TimeRange::new(0, 10)),
            (entry("db", "autogen", "mem"), TimeRange::new(0, 10)),
        ];
        let (tx, rx) = watch::channel(false);
        let m = monitor(&master, NodeRole::Master);
        let s = monitor(&slave, NodeRole::Slave);

        let full = backfill(&m, &s, &jobs, settings(), &rx, "test").await.unwrap();
        assert_eq!(full.descriptors, 2);
        assert!(!full.interrupted);

        tx.send(true).unwrap();
        let stopped = backfill(&m, &s, &jobs, settings(), &rx, "test").await.unwrap();
        assert_eq!(stopped.descriptors, 0);
        assert!(stopped.interrupted);
    }
}
