//! System logger
//!
//! Levelled diagnostic records with a source tag, persisted into the
//! `sys_logs` table through an asynchronous batch writer so the relay hot
//! path never blocks on log I/O. Billing rows are separate and live in the
//! `logs` table owned by `store::logs`.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

fn open_conn() -> Connection {
    Connection::open(crate::store::db_path()).unwrap()
}

/// Create the log table and start the batch writer. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let conn = open_conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sys_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sys_logs_timestamp ON sys_logs(timestamp DESC)",
            [],
        )
        .ok();
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sys_logs_level ON sys_logs(level)",
            [],
        )
        .ok();

        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        let mut sender = LOG_SENDER.write().unwrap();
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_buffer(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_buffer(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !buffer.is_empty() {
            flush_buffer(&mut buffer);
        }
    });
}

fn flush_buffer(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }

    let mut conn = open_conn();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(_) => return,
    };

    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO sys_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }

    let _ = tx.commit();
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    if matches!(level, LogLevel::Warn | LogLevel::Error) {
        eprintln!("[{}] {}: {}", level.as_str(), source, message);
    }

    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

/// Query log entries with optional filters, most recent first.
pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let conn = open_conn();
    let mut sql = String::from(
        "SELECT id, timestamp, level, source, message FROM sys_logs WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }

    sql.push_str(" ORDER BY timestamp DESC");
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(_) => return Vec::new(),
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    });

    match rows {
        Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Count matching log entries.
pub fn logs_count(query: &LogQuery) -> i64 {
    let conn = open_conn();
    let mut sql = String::from("SELECT COUNT(*) FROM sys_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }

    let mut stmt = match conn.prepare(&sql) {
        Ok(stmt) => stmt,
        Err(_) => return 0,
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    stmt.query_row(params_refs.as_slice(), |row| row.get(0))
        .unwrap_or(0)
}

/// Remove all system log rows, returning the number deleted.
pub fn clear_all_logs() -> Result<i64, String> {
    let conn = open_conn();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sys_logs", [], |row| row.get(0))
        .unwrap_or(0);
    conn.execute("DELETE FROM sys_logs", [])
        .map_err(|e| e.to_string())?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_string_roundtrip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("fatal"), None);
    }
}
