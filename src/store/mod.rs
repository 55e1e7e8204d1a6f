//! Persistence façade
//!
//! Relational storage over SQLite: users, tokens, channels, abilities,
//! logs, traces, options. Connections are opened per call with WAL enabled
//! so concurrent request handlers serialize on writes inside SQLite rather
//! than on an application lock. All timestamps are UTC unix seconds.

use dirs::data_dir;
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::path::PathBuf;

pub mod abilities;
pub mod channels;
pub mod logs;
pub mod options;
pub mod tokens;
pub mod traces;
pub mod users;

static DB_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Pin the database location. First caller wins; later calls are ignored.
pub fn use_database(path: &str) {
    let p = if path.trim().is_empty() {
        default_db_path()
    } else {
        PathBuf::from(path)
    };
    let _ = DB_PATH.set(p);
}

fn default_db_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("one-api");
    std::fs::create_dir_all(&p).ok();
    p.push("one-api.db");
    p
}

pub fn db_path() -> PathBuf {
    DB_PATH.get_or_init(default_db_path).clone()
}

pub(crate) fn open_conn() -> Connection {
    let conn = Connection::open(db_path()).expect("failed to open database");
    optimize_connection(&conn);
    conn
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", &"WAL").ok();
    conn.pragma_update(None, "synchronous", &"NORMAL").ok();
    conn.pragma_update(None, "cache_size", &"-64000").ok();
    conn.pragma_update(None, "temp_store", &"MEMORY").ok();
    conn.pragma_update(None, "busy_timeout", &"5000").ok();
}

/// Create every table and index. Idempotent; called once at start-up.
pub fn init() {
    let conn = open_conn();

    conn.execute(
        "create table if not exists users (
            id integer primary key autoincrement,
            role integer not null default 1,
            status integer not null default 1,
            user_group text not null default 'default',
            quota integer not null default 0,
            used_quota integer not null default 0,
            email text not null default ''
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists tokens (
            id integer primary key autoincrement,
            user_id integer not null,
            name text not null default '',
            key text not null unique,
            status integer not null default 1,
            remain_quota integer not null default 0,
            used_quota integer not null default 0,
            unlimited_quota integer not null default 0,
            models text not null default '',
            channel_pin integer,
            expires_at integer
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists channels (
            id integer primary key autoincrement,
            channel_type integer not null,
            name text not null default '',
            status integer not null default 1,
            priority integer not null default 0,
            weight integer not null default 0,
            groups text not null default 'default',
            models text not null default '',
            base_url text not null default '',
            key text not null default '',
            model_mapping text,
            price_overrides text,
            completion_ratio_overrides text,
            rate_limit integer,
            disable_structured_output integer not null default 0,
            balance real not null default 0,
            balance_updated_at integer,
            test_at integer,
            response_time_ms integer
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists abilities (
            channel_id integer not null,
            model text not null,
            user_group text not null,
            enabled integer not null default 1,
            priority integer not null default 0,
            weight integer not null default 0,
            suspend_429_until integer not null default 0,
            suspend_5xx_until integer not null default 0,
            suspend_auth_until integer not null default 0,
            primary key (channel_id, model, user_group)
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists logs (
            id integer primary key autoincrement,
            created_at integer not null,
            user_id integer not null default 0,
            token_id integer not null default 0,
            channel_id integer not null default 0,
            model text not null default '',
            request_id text not null default '',
            log_type integer not null,
            prompt_tokens integer not null default 0,
            completion_tokens integer not null default 0,
            quota integer not null default 0,
            latency_ms integer not null default 0,
            detail text,
            trace_id text not null default ''
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists traces (
            trace_id text primary key,
            log_id integer,
            url text not null default '',
            method text not null default '',
            body_size integer not null default 0,
            status integer,
            received_at integer,
            forwarded_at integer,
            first_upstream_at integer,
            first_client_at integer,
            upstream_done_at integer,
            completed_at integer
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create table if not exists options (
            key text primary key,
            value text not null
        )",
        [],
    )
    .unwrap();

    conn.execute(
        "create index if not exists idx_abilities_model_group on abilities(model, user_group, enabled)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_logs_created_at on logs(created_at desc)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_logs_request_id on logs(request_id)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_tokens_key on tokens(key)",
        [],
    )
    .ok();
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
