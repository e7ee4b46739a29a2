// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database driver seam.
//!
//! Defines what the agent needs from a time-series database: a liveness
//! probe, schema listing/creation and point reads/writes. The coordinator
//! only ever talks to a node through [`TsdbDriver`], which keeps the
//! replication logic testable against [`MemoryDriver`] and decoupled from
//! the wire protocol of [`HttpDriver`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ha_replicator::driver::{DriverFactory, HttpDriverFactory, TsdbDriver};
//! use ha_replicator::config::NodeConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = NodeConfig::for_testing("influx01", "http://localhost:8086");
//! let driver = HttpDriverFactory.connect(&node)?;
//! let version = driver.ping().await?;
//! println!("connected to {}", version);
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod memory;

pub use http::{HttpDriver, HttpDriverFactory};
pub use memory::MemoryDriver;

use crate::config::NodeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = DriverResult<T>> + Send + 'a>>;

/// Simplified error for driver operations.
///
/// The monitor lifts it into [`crate::error::ReplicationError::Driver`]
/// with node and operation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DriverError {}

// =============================================================================
// Data model
// =============================================================================

/// A field value as stored by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// A single time-series point.
///
/// Identity is (measurement, tags, timestamp): writing a point with the
/// same identity replaces the stored fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the unix epoch.
    pub timestamp: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Half-open time range `[start, end)` in unix nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Split into consecutive windows no wider than `width`.
    ///
    /// A zero width yields the whole range as a single window.
    pub fn chunks(&self, width: Duration) -> Vec<TimeRange> {
        if self.is_empty() {
            return Vec::new();
        }
        let width = i64::try_from(width.as_nanos()).unwrap_or(i64::MAX);
        if width <= 0 {
            return vec![*self];
        }
        let mut chunks = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = start.saturating_add(width).min(self.end);
            chunks.push(TimeRange::new(start, end));
            start = end;
        }
        chunks
    }
}

/// Retention policy descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Duration string as reported by the database ("0s" = infinite).
    pub duration: String,
    pub shard_group_duration: String,
    pub replication: u32,
    pub default: bool,
}

impl RetentionPolicy {
    /// The `autogen` policy every new database starts with.
    pub fn autogen() -> Self {
        Self {
            name: "autogen".to_string(),
            duration: "0s".to_string(),
            shard_group_duration: "168h0m0s".to_string(),
            replication: 1,
            default: true,
        }
    }

    pub fn named(name: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: duration.into(),
            shard_group_duration: "1h0m0s".to_string(),
            replication: 1,
            default: false,
        }
    }
}

/// Schema of one database on the master.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub retention_policies: Vec<RetentionPolicy>,
    pub measurements: Vec<String>,
}

/// One (database, retention policy, measurement) descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaEntry {
    pub database: String,
    pub retention_policy: String,
    pub measurement: String,
}

impl std::fmt::Display for SchemaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.retention_policy, self.measurement)
    }
}

/// Ordered view of the master schema. Transient: recomputed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub databases: Vec<DatabaseSchema>,
}

impl SchemaSnapshot {
    /// Flatten to descriptors, in database / policy / measurement order.
    pub fn entries(&self) -> Vec<SchemaEntry> {
        let mut entries = Vec::new();
        for db in &self.databases {
            for rp in &db.retention_policies {
                for m in &db.measurements {
                    entries.push(SchemaEntry {
                        database: db.name.clone(),
                        retention_policy: rp.name.clone(),
                        measurement: m.clone(),
                    });
                }
            }
        }
        entries
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseSchema> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

/// Databases the agent never replicates.
pub const INTERNAL_DATABASES: &[&str] = &["_internal"];

// =============================================================================
// Driver traits
// =============================================================================

/// Everything the agent needs from a database node.
///
/// Creation calls must be idempotent: creating an object that already
/// exists succeeds without altering it. `write_points` is an upsert.
pub trait TsdbDriver: Send + Sync + 'static {
    /// Liveness probe. Returns the server version.
    fn ping(&self) -> BoxFuture<'_, String>;

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>>;

    fn list_retention_policies<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<RetentionPolicy>>;

    fn list_measurements<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<String>>;

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()>;

    fn create_retention_policy<'a>(
        &'a self,
        db: &'a str,
        rp: &'a RetentionPolicy,
    ) -> BoxFuture<'a, ()>;

    /// Make a measurement exist. Databases that create measurements
    /// implicitly on first write may treat this as a no-op.
    fn create_measurement<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Read all points of a measurement inside `range`, ordered by time.
    fn read_points<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
        range: TimeRange,
    ) -> BoxFuture<'a, Vec<Point>>;

    fn write_points<'a>(&'a self, db: &'a str, rp: &'a str, points: &'a [Point]) -> BoxFuture<'a, ()>;

    /// Timestamp of the oldest point, `None` if the measurement is empty.
    fn first_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>>;

    /// Timestamp of the newest point, `None` if the measurement is empty.
    fn last_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>>;
}

/// Builds a driver for a configured node.
pub trait DriverFactory<D: TsdbDriver>: Send + Sync + 'static {
    fn connect(&self, node: &NodeConfig) -> DriverResult<Arc<D>>;
}

impl<D, F> DriverFactory<D> for F
where
    D: TsdbDriver,
    F: Fn(&NodeConfig) -> DriverResult<Arc<D>> + Send + Sync + 'static,
{
    fn connect(&self, node: &NodeConfig) -> DriverResult<Arc<D>> {
        self(node)
    }
}
