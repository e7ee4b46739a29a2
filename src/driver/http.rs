// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! InfluxDB 1.x HTTP driver.
//!
//! Speaks the plain HTTP API: `GET /ping` for liveness, `/query` for
//! InfluxQL statements (JSON results, `epoch=ns`) and `POST /write` with
//! line protocol. Every request carries the node timeout.
//!
//! Measurements cannot exist empty in InfluxDB, so `create_measurement` is
//! a no-op: the measurement appears on the slave with its first copied point.

use super::{
    BoxFuture, DriverError, DriverFactory, DriverResult, FieldValue, Point, RetentionPolicy,
    TimeRange, TsdbDriver,
};
use crate::config::NodeConfig;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Driver for one InfluxDB node.
#[derive(Debug, Clone)]
pub struct HttpDriver {
    name: String,
    base_url: String,
    user: String,
    password: String,
    client: Client,
}

/// Builds an [`HttpDriver`] per node.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDriverFactory;

impl DriverFactory<HttpDriver> for HttpDriverFactory {
    fn connect(&self, node: &NodeConfig) -> DriverResult<Arc<HttpDriver>> {
        HttpDriver::new(node).map(Arc::new)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Series {
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl Series {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl HttpDriver {
    pub fn new(node: &NodeConfig) -> DriverResult<Self> {
        let client = Client::builder()
            .timeout(node.timeout_duration())
            .build()
            .map_err(|e| DriverError::new(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            name: node.name.clone(),
            base_url: node.url.trim_end_matches('/').to_string(),
            user: node.user.clone(),
            password: node.password.clone(),
            client,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.user.is_empty() {
            request
        } else {
            request.basic_auth(&self.user, Some(&self.password))
        }
    }

    /// Run one InfluxQL statement and return its series.
    ///
    /// Statements that modify state go through POST as the API requires.
    async fn query(&self, statement: &str, db: Option<&str>, write: bool) -> DriverResult<Vec<Series>> {
        let url = format!("{}/query", self.base_url);
        let mut params = vec![("q", statement), ("epoch", "ns")];
        if let Some(db) = db {
            params.push(("db", db));
        }
        let request = if write {
            self.client.post(&url).form(&params)
        } else {
            self.client.get(&url).query(&params)
        };

        debug!(node = %self.name, statement, "InfluxQL query");
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| DriverError::new(format!("query failed: {}", e)))?;
        let status = response.status();
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| DriverError::new(format!("invalid query response ({}): {}", status, e)))?;

        if let Some(error) = body.error {
            return Err(DriverError::new(error));
        }
        let mut series = Vec::new();
        for result in body.results {
            if let Some(error) = result.error {
                return Err(DriverError::new(error));
            }
            series.extend(result.series);
        }
        Ok(series)
    }

    /// Oldest (`ASC`) or newest (`DESC`) point of a measurement.
    async fn edge_point(&self, db: &str, rp: &str, measurement: &str, order: &str) -> DriverResult<Vec<Series>> {
        let statement = format!(
            "SELECT * FROM {}.{} ORDER BY time {} LIMIT 1",
            quote_ident(rp),
            quote_ident(measurement),
            order
        );
        self.query(&statement, Some(db), false).await
    }

    /// Field name → type (`float`, `integer`, `string`, `boolean`).
    async fn field_types(&self, db: &str, rp: &str, measurement: &str) -> DriverResult<BTreeMap<String, String>> {
        let statement = format!(
            "SHOW FIELD KEYS ON {} FROM {}.{}",
            quote_ident(db),
            quote_ident(rp),
            quote_ident(measurement)
        );
        let mut types = BTreeMap::new();
        for series in self.query(&statement, None, false).await? {
            let (Some(key_col), Some(type_col)) = (series.column("fieldKey"), series.column("fieldType")) else {
                continue;
            };
            for row in &series.values {
                if let (Some(Value::String(k)), Some(Value::String(t))) = (row.get(key_col), row.get(type_col)) {
                    types.insert(k.clone(), t.clone());
                }
            }
        }
        Ok(types)
    }
}

impl TsdbDriver for HttpDriver {
    fn ping(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let url = format!("{}/ping", self.base_url);
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|e| DriverError::new(format!("ping failed: {}", e)))?;
            let status = response.status();
            if status != StatusCode::NO_CONTENT && !status.is_success() {
                return Err(DriverError::new(format!("ping returned {}", status)));
            }
            Ok(response
                .headers()
                .get("X-Influxdb-Version")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string())
        })
    }

    fn list_databases(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let series = self.query("SHOW DATABASES", None, false).await?;
            Ok(first_column_strings(&series))
        })
    }

    fn list_retention_policies<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<RetentionPolicy>> {
        Box::pin(async move {
            let statement = format!("SHOW RETENTION POLICIES ON {}", quote_ident(db));
            let series = self.query(&statement, None, false).await?;
            Ok(series.iter().flat_map(decode_retention_policies).collect())
        })
    }

    fn list_measurements<'a>(&'a self, db: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let statement = format!("SHOW MEASUREMENTS ON {}", quote_ident(db));
            let series = self.query(&statement, None, false).await?;
            Ok(first_column_strings(&series))
        })
    }

    fn create_database<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let statement = format!("CREATE DATABASE {}", quote_ident(db));
            self.query(&statement, None, true).await.map(|_| ())
        })
    }

    fn create_retention_policy<'a>(
        &'a self,
        db: &'a str,
        rp: &'a RetentionPolicy,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut statement = format!(
                "CREATE RETENTION POLICY {} ON {} DURATION {} REPLICATION {}",
                quote_ident(&rp.name),
                quote_ident(db),
                influx_duration(&rp.duration),
                rp.replication.max(1)
            );
            if !rp.shard_group_duration.is_empty() {
                statement.push_str(&format!(" SHARD DURATION {}", influx_duration(&rp.shard_group_duration)));
            }
            if rp.default {
                statement.push_str(" DEFAULT");
            }
            self.query(&statement, None, true).await.map(|_| ())
        })
    }

    fn create_measurement<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(node = %self.name, db, rp, measurement, "Measurement will be created on first write");
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
            let types = self.field_types(db, rp, measurement).await?;
            let statement = format!(
                "SELECT * FROM {}.{} WHERE time >= {} AND time < {} GROUP BY *",
                quote_ident(rp),
                quote_ident(measurement),
                range.start,
                range.end
            );
            let series = self.query(&statement, Some(db), false).await?;
            let mut points: Vec<Point> = series
                .iter()
                .flat_map(|s| decode_points(s, &types))
                .collect();
            points.sort_by_key(|p| p.timestamp);
            Ok(points)
        })
    }

    fn write_points<'a>(&'a self, db: &'a str, rp: &'a str, points: &'a [Point]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let url = format!("{}/write", self.base_url);
            let request = self
                .client
                .post(&url)
                .query(&[("db", db), ("rp", rp), ("precision", "ns")])
                .body(to_line_protocol(points));
            let response = self
                .authorize(request)
                .send()
                .await
                .map_err(|e| DriverError::new(format!("write failed: {}", e)))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(DriverError::new(format!("write returned {}: {}", status, body.trim())))
            }
        })
    }

    fn first_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            let series = self.edge_point(db, rp, measurement, "ASC").await?;
            Ok(series_times(&series).min())
        })
    }

    fn last_point_time<'a>(
        &'a self,
        db: &'a str,
        rp: &'a str,
        measurement: &'a str,
    ) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            let series = self.edge_point(db, rp, measurement, "DESC").await?;
            Ok(series_times(&series).max())
        })
    }
}

// =============================================================================
// Encoding / decoding
// =============================================================================

/// Quote an InfluxQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// InfluxDB reports infinite retention as "0s"; `CREATE` wants `INF`.
fn influx_duration(value: &str) -> &str {
    if value.is_empty() || value == "0s" || value == "0" {
        "INF"
    } else {
        value
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// First-row timestamps of each series.
fn series_times(series: &[Series]) -> impl Iterator<Item = i64> + '_ {
    series.iter().filter_map(|s| {
        let col = s.column("time")?;
        s.values.first()?.get(col)?.as_i64()
    })
}

/// Encode points as line protocol, one line per point.
///
/// Points without fields are skipped: the database would reject them.
pub fn to_line_protocol(points: &[Point]) -> String {
    let mut body = String::new();
    for point in points.iter().filter(|p| !p.fields.is_empty()) {
        body.push_str(&escape(&point.measurement, &[',', ' ']));
        for (k, v) in &point.tags {
            if v.is_empty() {
                continue;
            }
            body.push(',');
            body.push_str(&escape(k, &[',', '=', ' ']));
            body.push('=');
            body.push_str(&escape(v, &[',', '=', ' ']));
        }
        body.push(' ');
        let fields: Vec<String> = point
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k, &[',', '=', ' ']), encode_field(v)))
            .collect();
        body.push_str(&fields.join(","));
        body.push(' ');
        body.push_str(&point.timestamp.to_string());
        body.push('\n');
    }
    body
}

fn encode_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(f) => format!("{}", f),
        FieldValue::Integer(i) => format!("{}i", i),
        FieldValue::Boolean(b) => b.to_string(),
        FieldValue::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

fn decode_field(value: &Value, field_type: Option<&str>) -> Option<FieldValue> {
    match (field_type, value) {
        (_, Value::Null) => None,
        (Some("integer"), v) => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).map(FieldValue::Integer),
        (Some("float"), v) => v.as_f64().map(FieldValue::Float),
        (_, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
        (_, Value::String(s)) => Some(FieldValue::String(s.clone())),
        (_, Value::Number(n)) => n
            .as_i64()
            .map(FieldValue::Integer)
            .or_else(|| n.as_f64().map(FieldValue::Float)),
        _ => None,
    }
}

fn decode_points(series: &Series, types: &BTreeMap<String, String>) -> Vec<Point> {
    let Some(time_col) = series.column("time") else {
        return Vec::new();
    };
    let mut points = Vec::with_capacity(series.values.len());
    for row in &series.values {
        let Some(timestamp) = row.get(time_col).and_then(Value::as_i64) else {
            continue;
        };
        let mut point = Point::new(series.name.clone(), timestamp);
        point.tags = series.tags.iter().filter(|(_, v)| !v.is_empty()).map(|(k, v)| (k.clone(), v.clone())).collect();
        for (idx, column) in series.columns.iter().enumerate() {
            if idx == time_col {
                continue;
            }
            if let Some(value) = row.get(idx).and_then(|v| decode_field(v, types.get(column).map(String::as_str))) {
                point.fields.insert(column.clone(), value);
            }
        }
        if !point.fields.is_empty() {
            points.push(point);
        }
    }
    points
}

fn decode_retention_policies(series: &Series) -> Vec<RetentionPolicy> {
    let col = |name: &str| series.column(name);
    let (Some(name), Some(duration)) = (col("name"), col("duration")) else {
        return Vec::new();
    };
    let shard = col("shardGroupDuration");
    let replica = col("replicaN");
    let default = col("default");
    series
        .values
        .iter()
        .filter_map(|row| {
            Some(RetentionPolicy {
                name: row.get(name)?.as_str()?.to_string(),
                duration: row.get(duration)?.as_str()?.to_string(),
                shard_group_duration: shard
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                replication: replica
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32,
                default: default
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

fn first_column_strings(series: &[Series]) -> Vec<String> {
    series
        .iter()
        .flat_map(|s| s.values.iter())
        .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
        .collect()
}
