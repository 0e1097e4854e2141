//! SQLite store implementation.

use crate::endpoint::{cap_events, Alert, CheckResult, ConditionResult, Endpoint, Event, EventType, Status};
use crate::storage::paging::page_of;
use crate::storage::{
    check_time_range, truncate_to_hour, uptime_cleanup_cutoff, PagingParams, Store, StoreError,
    TriggeredAlert, MAXIMUM_NUMBER_OF_EVENTS, MAXIMUM_NUMBER_OF_RESULTS, UPTIME_CLEANUP_THRESHOLD,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Row count above which events are trimmed back to the cap.
const EVENTS_CLEANUP_THRESHOLD: usize = MAXIMUM_NUMBER_OF_EVENTS * 2;
/// Row count above which results are trimmed back to the cap.
const RESULTS_CLEANUP_THRESHOLD: usize = MAXIMUM_NUMBER_OF_RESULTS * 2;

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe SQLite store.
///
/// Rows are only trimmed once they reach twice the cap, so reads always
/// apply the cap themselves.
#[derive(Clone)]
pub struct SqlStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlStore {
    /// Open (or create) the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Database living only as long as the store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(include_str!("../../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn uptime_totals(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(u64, u64, u64), StoreError> {
        check_time_range(from, to)?;
        let conn = self.conn();
        let id = endpoint_id(&conn, key)?.ok_or(StoreError::EndpointNotFound)?;
        let (total, successful, response_time): (i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(total_executions), 0), COALESCE(SUM(successful_executions), 0), COALESCE(SUM(total_response_time), 0)
             FROM endpoint_uptimes
             WHERE endpoint_id = ?1 AND hour_unix_timestamp >= ?2 AND hour_unix_timestamp <= ?3",
            params![id, truncate_to_hour(from), to.timestamp()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok((total as u64, successful as u64, response_time as u64))
    }
}

impl Store for SqlStore {
    fn get_all(&self, paging: &PagingParams) -> Result<Vec<Status>, StoreError> {
        let conn = self.conn();
        let keys = {
            let mut stmt = conn.prepare("SELECT endpoint_key FROM endpoints ORDER BY endpoint_key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            keys
        };
        keys.iter()
            .map(|key| status_by_key(&conn, key, paging))
            .collect()
    }

    fn get_by_key(&self, key: &str, paging: &PagingParams) -> Result<Status, StoreError> {
        status_by_key(&self.conn(), key, paging)
    }

    fn uptime(&self, key: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<f64, StoreError> {
        let (total, successful, _) = self.uptime_totals(key, from, to)?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(successful as f64 / total as f64)
    }

    fn average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let (total, _, response_time) = self.uptime_totals(key, from, to)?;
        if total == 0 {
            return Ok(0);
        }
        Ok(response_time / total)
    }

    fn hourly_average_response_time(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<i64, u64>, StoreError> {
        check_time_range(from, to)?;
        let conn = self.conn();
        let id = endpoint_id(&conn, key)?.ok_or(StoreError::EndpointNotFound)?;
        let mut stmt = conn.prepare(
            "SELECT hour_unix_timestamp, total_executions, total_response_time
             FROM endpoint_uptimes
             WHERE endpoint_id = ?1 AND hour_unix_timestamp >= ?2 AND hour_unix_timestamp <= ?3 AND total_executions > 0
             ORDER BY hour_unix_timestamp",
        )?;
        let rows = stmt.query_map(params![id, truncate_to_hour(from), to.timestamp()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut hourly = BTreeMap::new();
        for row in rows {
            let (hour, total, response_time) = row?;
            hourly.insert(hour, response_time as u64 / total as u64);
        }
        Ok(hourly)
    }

    fn insert(&self, endpoint: &Endpoint, result: &CheckResult) -> Result<(), StoreError> {
        let key = endpoint.key();
        let conn = self.conn();
        let outcome = conn.unchecked_transaction().map_err(StoreError::from).and_then(|mut tx| {
            insert_result(&mut tx, endpoint, &key, result, Utc::now())?;
            tx.commit()?;
            Ok(())
        });
        if let Err(e) = &outcome {
            tracing::error!("SqlStore: Failed to insert result for {}: {}", key, e);
        }
        outcome
    }

    fn delete_not_in_keys(&self, keys: &[String]) -> usize {
        let conn = self.conn();
        let outcome = if keys.is_empty() {
            conn.execute("DELETE FROM endpoints", [])
        } else {
            conn.execute(
                &format!(
                    "DELETE FROM endpoints WHERE endpoint_key NOT IN ({})",
                    placeholders(keys.len())
                ),
                params_from_iter(keys.iter()),
            )
        };
        outcome.unwrap_or_else(|e| {
            tracing::error!("SqlStore: Failed to delete stale endpoints: {}", e);
            0
        })
    }

    fn get_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
    ) -> Result<Option<TriggeredAlert>, StoreError> {
        let conn = self.conn();
        let triggered = conn
            .query_row(
                "SELECT t.resolve_key, t.successes_in_a_row
                 FROM endpoint_alerts_triggered t
                 JOIN endpoints e ON e.endpoint_id = t.endpoint_id
                 WHERE e.endpoint_key = ?1 AND t.configuration_checksum = ?2",
                params![endpoint.key(), alert.checksum()],
                |row| {
                    Ok(TriggeredAlert {
                        resolve_key: row.get(0)?,
                        successes_in_a_row: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(triggered)
    }

    fn upsert_triggered_alert(
        &self,
        endpoint: &Endpoint,
        alert: &Alert,
        triggered: &TriggeredAlert,
    ) -> Result<(), StoreError> {
        let key = endpoint.key();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let id = match endpoint_id(&tx, &key)? {
            Some(id) => id,
            None => insert_endpoint(&tx, endpoint, &key)?,
        };
        tx.execute(
            "INSERT INTO endpoint_alerts_triggered (endpoint_id, configuration_checksum, resolve_key, successes_in_a_row)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint_id, configuration_checksum) DO UPDATE SET
                resolve_key = excluded.resolve_key,
                successes_in_a_row = excluded.successes_in_a_row",
            params![id, alert.checksum(), triggered.resolve_key, triggered.successes_in_a_row],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_triggered_alert(&self, endpoint: &Endpoint, alert: &Alert) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM endpoint_alerts_triggered
             WHERE configuration_checksum = ?1
               AND endpoint_id = (SELECT endpoint_id FROM endpoints WHERE endpoint_key = ?2)",
            params![alert.checksum(), endpoint.key()],
        )?;
        Ok(())
    }

    fn delete_triggered_alerts_not_in_checksums(
        &self,
        endpoint: &Endpoint,
        checksums: &[String],
    ) -> usize {
        let key = endpoint.key();
        let mut sql = "DELETE FROM endpoint_alerts_triggered
             WHERE endpoint_id = (SELECT endpoint_id FROM endpoints WHERE endpoint_key = ?)"
            .to_string();
        if !checksums.is_empty() {
            sql.push_str(&format!(
                " AND configuration_checksum NOT IN ({})",
                placeholders(checksums.len())
            ));
        }
        let args = std::iter::once(key.as_str()).chain(checksums.iter().map(String::as_str));
        self.conn()
            .execute(&sql, params_from_iter(args))
            .unwrap_or_else(|e| {
                tracing::error!("SqlStore: Failed to delete stale triggered alerts for {}: {}", key, e);
                0
            })
    }

    fn clear(&self) {
        if let Err(e) = self.conn().execute("DELETE FROM endpoints", []) {
            tracing::error!("SqlStore: Failed to clear: {}", e);
        }
    }

    fn close(&self) {
        if let Err(e) = self.conn().execute_batch("PRAGMA optimize;") {
            tracing::warn!("SqlStore: Failed to optimize before closing: {}", e);
        }
    }
}

// --- Write path ---

/// Everything one insert does, inside the caller's transaction.
fn insert_result(
    tx: &mut Transaction<'_>,
    endpoint: &Endpoint,
    key: &str,
    result: &CheckResult,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let id = match endpoint_id(tx, key)? {
        Some(id) => id,
        None => insert_endpoint(tx, endpoint, key)?,
    };

    if count_rows(tx, "endpoint_events", id)? == 0 {
        insert_event(tx, id, &Event::start_for(result))?;
        insert_event(tx, id, &Event::from_result(result))?;
    } else if last_result_success(tx, id)?.is_some_and(|last| last != result.success) {
        insert_event(tx, id, &Event::from_result(result))?;
    }

    insert_result_row(tx, id, result)?;

    tx.execute(
        "UPDATE endpoints SET
            successes_in_a_row = CASE WHEN ?2 THEN successes_in_a_row + 1 ELSE 0 END,
            failures_in_a_row = CASE WHEN ?2 THEN 0 ELSE failures_in_a_row + 1 END
         WHERE endpoint_id = ?1",
        params![id, result.success],
    )?;

    tx.execute(
        "INSERT INTO endpoint_uptimes (endpoint_id, hour_unix_timestamp, total_executions, successful_executions, total_response_time)
         VALUES (?1, ?2, 1, ?3, ?4)
         ON CONFLICT(endpoint_id, hour_unix_timestamp) DO UPDATE SET
            total_executions = total_executions + excluded.total_executions,
            successful_executions = successful_executions + excluded.successful_executions,
            total_response_time = total_response_time + excluded.total_response_time",
        params![
            id,
            truncate_to_hour(result.timestamp),
            result.success as i64,
            result.duration.as_millis() as i64
        ],
    )?;

    // Cleanups never fail the insert
    run_cleanup(tx, key, "events", |conn| {
        if count_rows(conn, "endpoint_events", id)? <= EVENTS_CLEANUP_THRESHOLD {
            return Ok(0);
        }
        conn.execute(
            "DELETE FROM endpoint_events
             WHERE endpoint_id = ?1 AND event_type != 'START'
               AND endpoint_event_id NOT IN (
                   SELECT endpoint_event_id FROM endpoint_events
                   WHERE endpoint_id = ?1 AND event_type != 'START'
                   ORDER BY endpoint_event_id DESC LIMIT ?2)",
            params![id, (MAXIMUM_NUMBER_OF_EVENTS - 1) as i64],
        )
    });
    run_cleanup(tx, key, "results", |conn| {
        if count_rows(conn, "endpoint_results", id)? <= RESULTS_CLEANUP_THRESHOLD {
            return Ok(0);
        }
        conn.execute(
            "DELETE FROM endpoint_results
             WHERE endpoint_id = ?1
               AND endpoint_result_id NOT IN (
                   SELECT endpoint_result_id FROM endpoint_results
                   WHERE endpoint_id = ?1
                   ORDER BY endpoint_result_id DESC LIMIT ?2)",
            params![id, MAXIMUM_NUMBER_OF_RESULTS as i64],
        )
    });
    run_cleanup(tx, key, "uptime buckets", |conn| {
        if count_rows(conn, "endpoint_uptimes", id)? <= UPTIME_CLEANUP_THRESHOLD {
            return Ok(0);
        }
        conn.execute(
            "DELETE FROM endpoint_uptimes WHERE endpoint_id = ?1 AND hour_unix_timestamp < ?2",
            params![id, uptime_cleanup_cutoff(now)],
        )
    });
    Ok(())
}

/// Run `cleanup` in a savepoint; a failure is logged and rolled back without
/// affecting the enclosing transaction.
fn run_cleanup<F>(tx: &mut Transaction<'_>, key: &str, what: &str, cleanup: F)
where
    F: FnOnce(&Connection) -> SqlResult<usize>,
{
    let sp = match tx.savepoint() {
        Ok(sp) => sp,
        Err(e) => {
            tracing::warn!("SqlStore: Skipping {} cleanup for {}: {}", what, key, e);
            return;
        }
    };
    match cleanup(&sp).and_then(|deleted| sp.commit().map(|_| deleted)) {
        Ok(0) => {}
        Ok(deleted) => tracing::debug!("SqlStore: Deleted {} old {} for {}", deleted, what, key),
        Err(e) => tracing::warn!("SqlStore: Failed to clean up {} for {}: {}", what, key, e),
    }
}

fn insert_endpoint(conn: &Connection, endpoint: &Endpoint, key: &str) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO endpoints (endpoint_key, endpoint_name, endpoint_group) VALUES (?1, ?2, ?3)",
        params![key, endpoint.name, endpoint.group],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_event(conn: &Connection, endpoint_id: i64, event: &Event) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO endpoint_events (endpoint_id, event_type, event_timestamp) VALUES (?1, ?2, ?3)",
        params![endpoint_id, event.event_type.as_str(), format_db_time(event.timestamp)],
    )?;
    Ok(())
}

fn insert_result_row(conn: &Connection, endpoint_id: i64, result: &CheckResult) -> SqlResult<()> {
    let errors = serde_json::to_string(&result.errors).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO endpoint_results (endpoint_id, success, errors, connected, status, dns_rcode, hostname, ip, duration, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            endpoint_id,
            result.success,
            errors,
            result.connected,
            result.http_status,
            result.dns_rcode,
            result.hostname,
            result.ip,
            i64::try_from(result.duration.as_nanos()).unwrap_or(i64::MAX),
            format_db_time(result.timestamp),
        ],
    )?;
    let result_id = conn.last_insert_rowid();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO endpoint_result_conditions (endpoint_result_id, condition, success) VALUES (?1, ?2, ?3)",
    )?;
    for condition in &result.condition_results {
        stmt.execute(params![result_id, condition.condition, condition.success])?;
    }
    Ok(())
}

fn last_result_success(conn: &Connection, endpoint_id: i64) -> SqlResult<Option<bool>> {
    conn.query_row(
        "SELECT success FROM endpoint_results WHERE endpoint_id = ?1 ORDER BY endpoint_result_id DESC LIMIT 1",
        params![endpoint_id],
        |row| row.get(0),
    )
    .optional()
}

// --- Read path ---

fn endpoint_id(conn: &Connection, key: &str) -> SqlResult<Option<i64>> {
    conn.query_row(
        "SELECT endpoint_id FROM endpoints WHERE endpoint_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

/// `table` is always one of this module's table names.
fn count_rows(conn: &Connection, table: &str, endpoint_id: i64) -> SqlResult<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(1) FROM {} WHERE endpoint_id = ?1", table),
        params![endpoint_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn status_by_key(conn: &Connection, key: &str, paging: &PagingParams) -> Result<Status, StoreError> {
    let row = conn
        .query_row(
            "SELECT endpoint_id, endpoint_name, endpoint_group, successes_in_a_row, failures_in_a_row
             FROM endpoints WHERE endpoint_key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((id, name, group, successes_in_a_row, failures_in_a_row)) = row else {
        return Err(StoreError::EndpointNotFound);
    };
    Ok(Status {
        name,
        group,
        key: key.to_string(),
        results: paged_results(conn, id, paging)?,
        events: paged_events(conn, id, paging)?,
        successes_in_a_row,
        failures_in_a_row,
        ..Default::default()
    })
}

fn paged_events(conn: &Connection, endpoint_id: i64, paging: &PagingParams) -> Result<Vec<Event>, StoreError> {
    // A page that is empty at the cap is empty for any smaller count
    if paging.events_window(MAXIMUM_NUMBER_OF_EVENTS).is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT event_type, event_timestamp FROM endpoint_events WHERE endpoint_id = ?1 ORDER BY endpoint_event_id ASC",
    )?;
    let rows = stmt
        .query_map(params![endpoint_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    let mut events = Vec::with_capacity(rows.len());
    for (event_type, timestamp) in rows {
        events.push(Event {
            event_type: event_type.parse::<EventType>().map_err(StoreError::Decode)?,
            timestamp: decode_time(&timestamp)?,
        });
    }
    cap_events(&mut events, MAXIMUM_NUMBER_OF_EVENTS);
    Ok(page_of(&events, paging.events_window(events.len())))
}

/// Raw columns of an `endpoint_results` row.
struct ResultRow {
    id: i64,
    success: bool,
    errors: String,
    connected: bool,
    status: Option<u16>,
    dns_rcode: Option<String>,
    hostname: Option<String>,
    ip: Option<String>,
    duration: i64,
    timestamp: String,
}

impl ResultRow {
    fn into_result(self) -> Result<CheckResult, StoreError> {
        let errors: Vec<String> = serde_json::from_str(&self.errors)
            .map_err(|e| StoreError::Decode(format!("result errors: {}", e)))?;
        Ok(CheckResult {
            timestamp: decode_time(&self.timestamp)?,
            success: self.success,
            connected: self.connected,
            duration: Duration::from_nanos(self.duration.max(0) as u64),
            http_status: self.status,
            hostname: self.hostname,
            ip: self.ip,
            dns_rcode: self.dns_rcode,
            errors,
            condition_results: Vec::new(),
        })
    }
}

fn paged_results(conn: &Connection, endpoint_id: i64, paging: &PagingParams) -> Result<Vec<CheckResult>, StoreError> {
    let total = count_rows(conn, "endpoint_results", endpoint_id)?;
    let visible = total.min(MAXIMUM_NUMBER_OF_RESULTS);
    let window = paging.results_window(visible);
    if window.is_empty() {
        return Ok(Vec::new());
    }
    let offset = (total - visible + window.start) as i64;

    let mut stmt = conn.prepare_cached(
        "SELECT endpoint_result_id, success, errors, connected, status, dns_rcode, hostname, ip, duration, timestamp
         FROM endpoint_results
         WHERE endpoint_id = ?1
         ORDER BY endpoint_result_id ASC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(params![endpoint_id, window.len() as i64, offset], |row| {
            Ok(ResultRow {
                id: row.get(0)?,
                success: row.get(1)?,
                errors: row.get(2)?,
                connected: row.get(3)?,
                status: row.get(4)?,
                dns_rcode: row.get(5)?,
                hostname: row.get(6)?,
                ip: row.get(7)?,
                duration: row.get(8)?,
                timestamp: row.get(9)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    let (Some(first_id), Some(last_id)) = (rows.first().map(|r| r.id), rows.last().map(|r| r.id)) else {
        return Ok(Vec::new());
    };
    let mut positions = HashMap::with_capacity(rows.len());
    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        positions.insert(row.id, results.len());
        results.push(row.into_result()?);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT c.endpoint_result_id, c.condition, c.success
         FROM endpoint_result_conditions c
         JOIN endpoint_results r ON r.endpoint_result_id = c.endpoint_result_id
         WHERE r.endpoint_id = ?1 AND c.endpoint_result_id BETWEEN ?2 AND ?3
         ORDER BY c.endpoint_result_condition_id ASC",
    )?;
    let conditions = stmt.query_map(params![endpoint_id, first_id, last_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            ConditionResult {
                condition: row.get(1)?,
                success: row.get(2)?,
            },
        ))
    })?;
    for condition in conditions {
        let (result_id, condition) = condition?;
        if let Some(&position) = positions.get(&result_id) {
            results[position].condition_results.push(condition);
        }
    }
    Ok(results)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_db_time(s).ok_or_else(|| StoreError::Decode(format!("timestamp {:?}", s)))
}

fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
