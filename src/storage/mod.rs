//! SQLite storage layer -- pool, schema, and the telemetry append log.
//!
//! Two access paths matter to the analysis pipeline: `(endpoint, timestamp)`
//! range scans for the learner and detector, and `trace_id` lookups for trace
//! reconstruction during root cause analysis. Both are indexed.

pub mod schema;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::telemetry::{NewRecord, TelemetryRecord};

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).context("failed to open connection pool")?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Serialize an instant the way the store persists it: RFC 3339 UTC with
/// microsecond precision. Fixed-width, so lexicographic order on the TEXT
/// column matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into a UTC instant.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("malformed timestamp in store: {s}"))?
        .with_timezone(&Utc))
}

/// One-pass aggregate over an endpoint's records in a time window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EndpointAggregate {
    pub count: u64,
    pub avg_latency_ms: f64,
    pub status_histogram: BTreeMap<u16, u64>,
    pub error_count_5xx: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl EndpointAggregate {
    /// 5xx ratio over the window; zero when the window is empty.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count_5xx as f64 / self.count as f64
        }
    }
}

/// Handle over the telemetry append log.
#[derive(Clone)]
pub struct TelemetryStore {
    pool: Pool,
}

impl TelemetryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert one record, enforcing the store invariants, and return the
    /// assigned id. Concurrent inserts serialize on the SQLite write lock.
    pub fn insert(&self, record: &NewRecord) -> Result<i64> {
        record.validate()?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO telemetry
             (service_name, endpoint, method, status_code, latency_ms,
              error_message, trace_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.service_name,
                record.endpoint,
                record.method,
                record.status_code,
                record.latency_ms,
                record.error_message,
                record.trace_id,
                fmt_ts(record.timestamp),
            ],
        )
        .context("telemetry insert failed")?;
        Ok(conn.last_insert_rowid())
    }

    /// All records for `endpoint` with `since <= timestamp < until`, in
    /// chronological order.
    pub fn query_endpoint_window(
        &self,
        endpoint: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_name, endpoint, method, status_code, latency_ms,
                    error_message, trace_id, timestamp
             FROM telemetry
             WHERE endpoint = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![endpoint, fmt_ts(since), fmt_ts(until)], row_tuple)?;
        collect_records(rows)
    }

    /// All records belonging to one trace, ascending by timestamp with the
    /// id as a stable tie-break.
    pub fn query_by_trace(&self, trace_id: &str) -> Result<Vec<TelemetryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_name, endpoint, method, status_code, latency_ms,
                    error_message, trace_id, timestamp
             FROM telemetry
             WHERE trace_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![trace_id], row_tuple)?;
        collect_records(rows)
    }

    /// Endpoints with at least one record since `since`.
    pub fn distinct_endpoints(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT endpoint FROM telemetry WHERE timestamp >= ?1 ORDER BY endpoint",
        )?;
        let rows = stmt.query_map(params![fmt_ts(since)], |row| row.get::<_, String>(0))?;
        let mut endpoints = Vec::new();
        for r in rows {
            endpoints.push(r?);
        }
        Ok(endpoints)
    }

    /// Count records for `endpoint` in `[since, until)` without materializing
    /// them. Used by the silence detector.
    pub fn count_in_window(
        &self,
        endpoint: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM telemetry
             WHERE endpoint = ?1 AND timestamp >= ?2 AND timestamp < ?3",
            params![endpoint, fmt_ts(since), fmt_ts(until)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Timestamp of the most recent record for `endpoint`, if any.
    pub fn last_seen(&self, endpoint: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM telemetry WHERE endpoint = ?1",
            params![endpoint],
            |row| row.get(0),
        )?;
        ts.as_deref().map(parse_ts).transpose()
    }

    /// Compute the window aggregate for one endpoint in a single scan.
    pub fn aggregate(
        &self,
        endpoint: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<EndpointAggregate> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT status_code, latency_ms, timestamp FROM telemetry
             WHERE endpoint = ?1 AND timestamp >= ?2 AND timestamp < ?3",
        )?;
        let rows = stmt.query_map(params![endpoint, fmt_ts(since), fmt_ts(until)], |row| {
            Ok((
                row.get::<_, u16>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut agg = EndpointAggregate::default();
        let mut latency_sum = 0.0;
        for r in rows {
            let (status, latency, ts) = r?;
            agg.count += 1;
            latency_sum += latency;
            *agg.status_histogram.entry(status).or_insert(0) += 1;
            if status >= 500 {
                agg.error_count_5xx += 1;
            }
            let ts = parse_ts(&ts)?;
            if agg.last_seen.map_or(true, |seen| ts > seen) {
                agg.last_seen = Some(ts);
            }
        }
        if agg.count > 0 {
            agg.avg_latency_ms = latency_sum / agg.count as f64;
        }
        Ok(agg)
    }

    /// Total number of records in the store.
    pub fn count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM telemetry", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete records strictly older than `cutoff`. Returns how many rows
    /// were removed. Callers are responsible for keeping `cutoff` outside the
    /// analysis and baseline windows.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM telemetry WHERE timestamp < ?1",
            params![fmt_ts(cutoff)],
        )?;
        Ok(removed)
    }
}

type RowTuple = (
    i64,
    String,
    String,
    String,
    u16,
    f64,
    Option<String>,
    String,
    String,
);

fn row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<RowTuple>>,
) -> Result<Vec<TelemetryRecord>> {
    let mut records = Vec::new();
    for r in rows {
        let (id, service_name, endpoint, method, status_code, latency_ms, error_message, trace_id, ts) =
            r?;
        records.push(TelemetryRecord {
            id,
            service_name,
            endpoint,
            method,
            status_code,
            latency_ms,
            error_message,
            trace_id,
            timestamp: parse_ts(&ts)?,
        });
    }
    Ok(records)
}
