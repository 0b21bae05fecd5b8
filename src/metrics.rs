//! Call-metrics ledger: per-request recording and windowed aggregation.
//!
//! Every gateway call is recorded, success or failure, including calls that
//! never authenticated. Recording must not take a request down with it —
//! the gateway layer logs and swallows recording errors.
//!
//! All aggregation leans on the store's timestamp format: fixed-precision
//! RFC 3339 UTC strings compare lexicographically, so window filters are
//! plain string comparisons and bucketing is `substr` on the timestamp
//! (13 chars = hour, 10 chars = day).

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::GatewayError;

/// Bounds on the `recent calls` page size.
const RECENT_LIMIT_MIN: u32 = 1;
const RECENT_LIMIT_MAX: u32 = 500;
const RECENT_LIMIT_DEFAULT: u32 = 50;

// ── Recording ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallMetric {
    pub registration_id: String,
    pub timestamp: String,
    pub method: String,
    pub endpoint: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub request_size: u64,
    pub response_size: u64,
    pub error_message: Option<String>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
}

pub fn record(conn: &Connection, metric: &ApiCallMetric) -> Result<(), GatewayError> {
    conn.execute(
        "INSERT INTO api_call_metrics
            (registration_id, timestamp, method, endpoint, response_time_ms,
             status_code, request_size, response_size, error_message,
             user_agent, client_ip)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        (
            &metric.registration_id,
            &metric.timestamp,
            &metric.method,
            &metric.endpoint,
            metric.response_time_ms,
            metric.status_code,
            metric.request_size,
            metric.response_size,
            &metric.error_message,
            &metric.user_agent,
            &metric.client_ip,
        ),
    )?;
    Ok(())
}

// ── Windows ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    H24,
    D7,
    D30,
}

impl TimeWindow {
    /// Query-string form (`24h`/`7d`/`30d`); anything else is the default.
    pub fn from_query(raw: Option<&str>) -> TimeWindow {
        match raw {
            Some("7d") => TimeWindow::D7,
            Some("30d") => TimeWindow::D30,
            _ => TimeWindow::H24,
        }
    }

    /// Inclusive lower bound, as a store-format timestamp.
    fn start(&self) -> String {
        let delta = match self {
            TimeWindow::H24 => Duration::hours(24),
            TimeWindow::D7 => Duration::days(7),
            TimeWindow::D30 => Duration::days(30),
        };
        (Utc::now() - delta).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Bucket key width: hour granularity inside a day, day granularity
    /// beyond.
    fn bucket_prefix_len(&self) -> u32 {
        match self {
            TimeWindow::H24 => 13,
            TimeWindow::D7 | TimeWindow::D30 => 10,
        }
    }
}

// ── Aggregates ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub success_count: u64,
    pub client_error_count: u64,
    pub server_error_count: u64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    pub average_response_time_ms: f64,
}

pub fn summarize(
    conn: &Connection,
    registration_id: &str,
    window: TimeWindow,
) -> Result<MetricsSummary, GatewayError> {
    let summary = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status_code < 400), 0),
                COALESCE(SUM(status_code >= 400 AND status_code < 500), 0),
                COALESCE(SUM(status_code >= 500), 0),
                COALESCE(MIN(response_time_ms), 0),
                COALESCE(MAX(response_time_ms), 0),
                COALESCE(AVG(response_time_ms), 0.0)
         FROM api_call_metrics
         WHERE registration_id = ?1 AND timestamp >= ?2",
        (registration_id, window.start()),
        |row| {
            Ok(MetricsSummary {
                total_requests: row.get(0)?,
                success_count: row.get(1)?,
                client_error_count: row.get(2)?,
                server_error_count: row.get(3)?,
                min_response_time_ms: row.get(4)?,
                max_response_time_ms: row.get(5)?,
                average_response_time_ms: row.get(6)?,
            })
        },
    )?;
    Ok(summary)
}

/// Summary across every registration owned by `user_id`. Averages are
/// recombined weighted by request count, not averaged per registration.
pub fn summarize_user(
    conn: &Connection,
    user_id: &str,
    window: TimeWindow,
) -> Result<MetricsSummary, GatewayError> {
    let mut stmt = conn.prepare("SELECT id FROM api_registrations WHERE user_id = ?1")?;
    let ids: Vec<String> =
        stmt.query_map([user_id], |row| row.get(0))?.collect::<Result<_, _>>()?;

    let mut combined = MetricsSummary {
        min_response_time_ms: u64::MAX,
        ..Default::default()
    };
    let mut weighted_sum = 0.0;
    for id in ids {
        let s = summarize(conn, &id, window)?;
        if s.total_requests == 0 {
            continue;
        }
        weighted_sum += s.average_response_time_ms * s.total_requests as f64;
        combined.total_requests += s.total_requests;
        combined.success_count += s.success_count;
        combined.client_error_count += s.client_error_count;
        combined.server_error_count += s.server_error_count;
        combined.min_response_time_ms = combined.min_response_time_ms.min(s.min_response_time_ms);
        combined.max_response_time_ms = combined.max_response_time_ms.max(s.max_response_time_ms);
    }
    if combined.total_requests == 0 {
        return Ok(MetricsSummary::default());
    }
    combined.average_response_time_ms = weighted_sum / combined.total_requests as f64;
    Ok(combined)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// Start of the bucket as a store-format timestamp.
    pub bucket_start: String,
    pub request_count: u64,
    pub average_response_time_ms: f64,
    pub error_rate_percent: f64,
}

pub fn time_series(
    conn: &Connection,
    registration_id: &str,
    window: TimeWindow,
) -> Result<Vec<TimeBucket>, GatewayError> {
    let prefix_len = window.bucket_prefix_len();
    let mut stmt = conn.prepare(
        "SELECT substr(timestamp, 1, ?3) AS bucket,
                COUNT(*),
                AVG(response_time_ms),
                SUM(status_code >= 400)
         FROM api_call_metrics
         WHERE registration_id = ?1 AND timestamp >= ?2
         GROUP BY bucket
         ORDER BY bucket ASC",
    )?;
    let rows = stmt.query_map((registration_id, window.start(), prefix_len), |row| {
        let bucket: String = row.get(0)?;
        let count: u64 = row.get(1)?;
        let avg: f64 = row.get(2)?;
        let errors: u64 = row.get(3)?;
        Ok(TimeBucket {
            bucket_start: bucket_start(&bucket),
            request_count: count,
            average_response_time_ms: avg,
            error_rate_percent: errors as f64 * 100.0 / count as f64,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Rebuild a full timestamp from a truncated bucket key.
fn bucket_start(bucket: &str) -> String {
    match bucket.len() {
        13 => format!("{bucket}:00:00.000Z"),
        10 => format!("{bucket}T00:00:00.000Z"),
        _ => bucket.to_string(),
    }
}

pub fn recent_calls(
    conn: &Connection,
    registration_id: &str,
    limit: Option<u32>,
) -> Result<Vec<ApiCallMetric>, GatewayError> {
    let limit = limit
        .unwrap_or(RECENT_LIMIT_DEFAULT)
        .clamp(RECENT_LIMIT_MIN, RECENT_LIMIT_MAX);
    let mut stmt = conn.prepare(
        "SELECT registration_id, timestamp, method, endpoint, response_time_ms,
                status_code, request_size, response_size, error_message,
                user_agent, client_ip
         FROM api_call_metrics
         WHERE registration_id = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map((registration_id, limit), |row| {
        Ok(ApiCallMetric {
            registration_id: row.get(0)?,
            timestamp: row.get(1)?,
            method: row.get(2)?,
            endpoint: row.get(3)?,
            response_time_ms: row.get(4)?,
            status_code: row.get(5)?,
            request_size: row.get(6)?,
            response_size: row.get(7)?,
            error_message: row.get(8)?,
            user_agent: row.get(9)?,
            client_ip: row.get(10)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

// ── Retention ─────────────────────────────────────────────────────────────────

/// Delete rows older than `days`. Returns how many were removed.
pub fn purge_older_than(conn: &Connection, days: u32) -> Result<usize, GatewayError> {
    let cutoff =
        (Utc::now() - Duration::days(days as i64)).to_rfc3339_opts(SecondsFormat::Millis, true);
    let removed =
        conn.execute("DELETE FROM api_call_metrics WHERE timestamp < ?1", [&cutoff])?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, init_schema};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn metric(registration: &str, status: u16, ms: u64) -> ApiCallMetric {
        ApiCallMetric {
            registration_id: registration.into(),
            timestamp: store::now(),
            method: "POST".into(),
            endpoint: "/chat".into(),
            response_time_ms: ms,
            status_code: status,
            request_size: 100,
            response_size: 250,
            error_message: (status >= 400).then(|| "boom".into()),
            user_agent: Some("metrics-test/1.0".into()),
            client_ip: Some("127.0.0.1".into()),
        }
    }

    fn ago(hours: i64) -> String {
        (Utc::now() - Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    #[test]
    fn summary_counts_and_buckets_by_status_class() {
        let conn = conn();
        record(&conn, &metric("r1", 200, 100)).unwrap();
        record(&conn, &metric("r1", 200, 300)).unwrap();
        record(&conn, &metric("r1", 401, 10)).unwrap();
        record(&conn, &metric("r1", 502, 50)).unwrap();
        record(&conn, &metric("other", 200, 5)).unwrap();

        let s = summarize(&conn, "r1", TimeWindow::H24).unwrap();
        assert_eq!(s.total_requests, 4);
        assert_eq!(s.success_count, 2);
        assert_eq!(s.client_error_count, 1);
        assert_eq!(s.server_error_count, 1);
        assert_eq!(s.min_response_time_ms, 10);
        assert_eq!(s.max_response_time_ms, 300);
        assert_eq!(s.average_response_time_ms, 115.0);
    }

    #[test]
    fn summary_of_nothing_is_zeroes() {
        let conn = conn();
        let s = summarize(&conn, "r1", TimeWindow::H24).unwrap();
        assert_eq!(s.total_requests, 0);
        assert_eq!(s.average_response_time_ms, 0.0);
    }

    #[test]
    fn window_excludes_older_rows() {
        let conn = conn();
        let mut old = metric("r1", 200, 100);
        old.timestamp = ago(30);
        record(&conn, &old).unwrap();
        record(&conn, &metric("r1", 200, 100)).unwrap();

        assert_eq!(summarize(&conn, "r1", TimeWindow::H24).unwrap().total_requests, 1);
        assert_eq!(summarize(&conn, "r1", TimeWindow::D7).unwrap().total_requests, 2);
    }

    #[test]
    fn window_parsing_defaults_to_24h() {
        assert_eq!(TimeWindow::from_query(Some("7d")), TimeWindow::D7);
        assert_eq!(TimeWindow::from_query(Some("30d")), TimeWindow::D30);
        assert_eq!(TimeWindow::from_query(Some("1y")), TimeWindow::H24);
        assert_eq!(TimeWindow::from_query(None), TimeWindow::H24);
    }

    #[test]
    fn time_series_buckets_by_hour_inside_a_day() {
        let conn = conn();
        let mut a = metric("r1", 200, 100);
        a.timestamp = ago(2);
        let mut b = metric("r1", 500, 200);
        b.timestamp = ago(2);
        let mut c = metric("r1", 200, 50);
        c.timestamp = ago(1);
        for m in [&a, &b, &c] {
            record(&conn, m).unwrap();
        }

        let buckets = time_series(&conn, "r1", TimeWindow::H24).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].request_count, 2);
        assert_eq!(buckets[0].error_rate_percent, 50.0);
        assert_eq!(buckets[0].average_response_time_ms, 150.0);
        assert_eq!(buckets[1].request_count, 1);
        // hour bucket expands back to a full timestamp
        assert!(buckets[0].bucket_start.ends_with(":00:00.000Z"));
        assert!(buckets[0].bucket_start < buckets[1].bucket_start);
    }

    #[test]
    fn recent_calls_are_newest_first_and_clamped() {
        let conn = conn();
        for i in 0..5 {
            let mut m = metric("r1", 200, i);
            m.timestamp = ago(5 - i as i64);
            record(&conn, &m).unwrap();
        }
        let calls = recent_calls(&conn, "r1", Some(3)).unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].timestamp > calls[2].timestamp);

        // limit 0 clamps up to 1
        assert_eq!(recent_calls(&conn, "r1", Some(0)).unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let conn = conn();
        let mut old = metric("r1", 200, 1);
        old.timestamp = ago(40 * 24);
        record(&conn, &old).unwrap();
        record(&conn, &metric("r1", 200, 1)).unwrap();

        assert_eq!(purge_older_than(&conn, 30).unwrap(), 1);
        assert_eq!(summarize(&conn, "r1", TimeWindow::D30).unwrap().total_requests, 1);
    }

    #[test]
    fn user_summary_recombines_weighted_averages() {
        let conn = conn();
        // registrations need backing rows for the user join
        let config = crate::store::InferenceConfiguration::new(
            "u1",
            "c",
            crate::providers::ProviderKind::Local,
            r#"{"model":"m"}"#,
        );
        crate::store::insert_configuration(&conn, &config).unwrap();
        let r1 = crate::store::ApiRegistration::new("u1", "a", &config.id, None);
        let r2 = crate::store::ApiRegistration::new("u1", "b", &config.id, None);
        crate::store::insert_registration(&conn, &r1).unwrap();
        crate::store::insert_registration(&conn, &r2).unwrap();

        record(&conn, &metric(&r1.id, 200, 100)).unwrap();
        record(&conn, &metric(&r2.id, 200, 200)).unwrap();
        record(&conn, &metric(&r2.id, 500, 400)).unwrap();

        let s = summarize_user(&conn, "u1", TimeWindow::H24).unwrap();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.server_error_count, 1);
        assert_eq!(s.min_response_time_ms, 100);
        assert_eq!(s.max_response_time_ms, 400);
        // (100*1 + 300*2) / 3
        assert!((s.average_response_time_ms - 233.33).abs() < 0.01);

        let empty = summarize_user(&conn, "nobody", TimeWindow::H24).unwrap();
        assert_eq!(empty.total_requests, 0);
        assert_eq!(empty.min_response_time_ms, 0);
    }
}
