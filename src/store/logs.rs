//! Billing and event log rows
//!
//! One row per charge event. A relayed request produces one usage row whose
//! quota equals pre-consumption plus streaming flushes plus the reconcile
//! delta; streaming flushes themselves are folded into that single row, so
//! the identity is asserted over the row, not reconstructed from pieces.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;

use super::{now_unix, open_conn};

pub const TYPE_TOPUP: i64 = 1;
pub const TYPE_USAGE: i64 = 2;
pub const TYPE_ADMIN: i64 = 3;
pub const TYPE_SYSTEM: i64 = 4;
pub const TYPE_TEST: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub request_id: String,
    pub log_type: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub latency_ms: i64,
    pub detail: Option<String>,
    pub trace_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct UsageRecord<'a> {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    /// The model name exactly as the client requested it.
    pub model: &'a str,
    pub request_id: &'a str,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub latency_ms: i64,
    pub detail: Option<&'a str>,
    pub trace_id: &'a str,
}

pub fn record_usage(rec: &UsageRecord) -> AppResult<i64> {
    insert(TYPE_USAGE, rec)
}

pub fn record_test(rec: &UsageRecord) -> AppResult<i64> {
    insert(TYPE_TEST, rec)
}

fn insert(log_type: i64, rec: &UsageRecord) -> AppResult<i64> {
    let conn = open_conn();
    conn.execute(
        "insert into logs(created_at, user_id, token_id, channel_id, model, request_id,
                          log_type, prompt_tokens, completion_tokens, quota, latency_ms,
                          detail, trace_id)
         values(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            now_unix(),
            rec.user_id,
            rec.token_id,
            rec.channel_id,
            rec.model,
            rec.request_id,
            log_type,
            rec.prompt_tokens,
            rec.completion_tokens,
            rec.quota,
            rec.latency_ms,
            rec.detail,
            rec.trace_id
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn record_system(user_id: i64, detail: &str) -> AppResult<i64> {
    let conn = open_conn();
    conn.execute(
        "insert into logs(created_at, user_id, log_type, detail)
         values(?1, ?2, ?3, ?4)",
        params![now_unix(), user_id, TYPE_SYSTEM, detail],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn record_topup(user_id: i64, quota: i64, detail: &str) -> AppResult<i64> {
    let conn = open_conn();
    conn.execute(
        "insert into logs(created_at, user_id, log_type, quota, detail)
         values(?1, ?2, ?3, ?4, ?5)",
        params![now_unix(), user_id, TYPE_TOPUP, quota, detail],
    )?;
    Ok(conn.last_insert_rowid())
}

const LOG_COLUMNS: &str = "id, created_at, user_id, token_id, channel_id, model, request_id, \
     log_type, prompt_tokens, completion_tokens, quota, latency_ms, detail, trace_id";

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        created_at: row.get(1)?,
        user_id: row.get(2)?,
        token_id: row.get(3)?,
        channel_id: row.get(4)?,
        model: row.get(5)?,
        request_id: row.get(6)?,
        log_type: row.get(7)?,
        prompt_tokens: row.get(8)?,
        completion_tokens: row.get(9)?,
        quota: row.get(10)?,
        latency_ms: row.get(11)?,
        detail: row.get(12)?,
        trace_id: row.get(13)?,
    })
}

pub fn get(id: i64) -> AppResult<Option<LogEntry>> {
    let conn = open_conn();
    let mut stmt =
        conn.prepare_cached(&format!("select {} from logs where id = ?1", LOG_COLUMNS))?;
    Ok(stmt.query_row(params![id], row_to_entry).optional()?)
}

pub fn find_by_request_id(request_id: &str) -> AppResult<Option<LogEntry>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from logs where request_id = ?1 order by id desc limit 1",
        LOG_COLUMNS
    ))?;
    Ok(stmt.query_row(params![request_id], row_to_entry).optional()?)
}

pub fn recent(limit: i64, offset: i64) -> AppResult<Vec<LogEntry>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from logs order by created_at desc, id desc limit ?1 offset ?2",
        LOG_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit, offset], row_to_entry)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn count() -> AppResult<i64> {
    let conn = open_conn();
    let result = conn
        .prepare_cached("select count(*) from logs")?
        .query_row([], |row| row.get(0))?;
    Ok(result)
}
