//! Trace rows
//!
//! Six canonical milestones per request. Milestones are written as they
//! happen; durations are derived at read time and clamped at zero so clock
//! skew never shows a negative span.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;

use super::open_conn;

/// Canonical milestone keys in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Received,
    Forwarded,
    FirstUpstreamResponse,
    FirstClientResponse,
    UpstreamCompleted,
    Completed,
}

impl Milestone {
    fn column(&self) -> &'static str {
        match self {
            Milestone::Received => "received_at",
            Milestone::Forwarded => "forwarded_at",
            Milestone::FirstUpstreamResponse => "first_upstream_at",
            Milestone::FirstClientResponse => "first_client_at",
            Milestone::UpstreamCompleted => "upstream_done_at",
            Milestone::Completed => "completed_at",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub log_id: Option<i64>,
    pub url: String,
    pub method: String,
    pub body_size: i64,
    pub status: Option<i64>,
    pub received_at: Option<i64>,
    pub forwarded_at: Option<i64>,
    pub first_upstream_at: Option<i64>,
    pub first_client_at: Option<i64>,
    pub upstream_done_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TraceRecord {
    /// Milliseconds between two milestones, clamped at zero.
    pub fn span_ms(from: Option<i64>, to: Option<i64>) -> Option<i64> {
        match (from, to) {
            (Some(a), Some(b)) => Some((b - a).max(0)),
            _ => None,
        }
    }
}

pub fn create(trace_id: &str, url: &str, method: &str, body_size: i64, ts: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "insert or replace into traces(trace_id, url, method, body_size, received_at)
         values(?1, ?2, ?3, ?4, ?5)",
        params![trace_id, url, method, body_size, ts],
    )?;
    Ok(())
}

pub fn set_milestone(trace_id: &str, milestone: Milestone, ts: i64) -> AppResult<()> {
    let conn = open_conn();
    let sql = format!(
        "update traces set {} = ?1 where trace_id = ?2",
        milestone.column()
    );
    conn.execute(&sql, params![ts, trace_id])?;
    Ok(())
}

pub fn set_status(trace_id: &str, status: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update traces set status = ?1 where trace_id = ?2",
        params![status, trace_id],
    )?;
    Ok(())
}

/// Attach the billing log row once it exists; a trace without a log means
/// the request died mid-flight.
pub fn pair_log(trace_id: &str, log_id: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update traces set log_id = ?1 where trace_id = ?2",
        params![log_id, trace_id],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TraceRecord> {
    Ok(TraceRecord {
        trace_id: row.get(0)?,
        log_id: row.get(1)?,
        url: row.get(2)?,
        method: row.get(3)?,
        body_size: row.get(4)?,
        status: row.get(5)?,
        received_at: row.get(6)?,
        forwarded_at: row.get(7)?,
        first_upstream_at: row.get(8)?,
        first_client_at: row.get(9)?,
        upstream_done_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

const TRACE_COLUMNS: &str = "trace_id, log_id, url, method, body_size, status, received_at, \
     forwarded_at, first_upstream_at, first_client_at, upstream_done_at, completed_at";

pub fn get(trace_id: &str) -> AppResult<Option<TraceRecord>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from traces where trace_id = ?1",
        TRACE_COLUMNS
    ))?;
    Ok(stmt.query_row(params![trace_id], row_to_record).optional()?)
}

pub fn get_by_log(log_id: i64) -> AppResult<Option<TraceRecord>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from traces where log_id = ?1",
        TRACE_COLUMNS
    ))?;
    Ok(stmt.query_row(params![log_id], row_to_record).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_clamp_negative_to_zero() {
        assert_eq!(TraceRecord::span_ms(Some(100), Some(250)), Some(150));
        assert_eq!(TraceRecord::span_ms(Some(250), Some(100)), Some(0));
        assert_eq!(TraceRecord::span_ms(None, Some(100)), None);
        assert_eq!(TraceRecord::span_ms(Some(100), None), None);
    }
}
