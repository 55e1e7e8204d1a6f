//! User rows and quota mutation
//!
//! Quota changes go through single-statement compare-and-decrement so that
//! concurrent request handlers serialize inside SQLite. The cached quota in
//! `cache` is best-effort and invalidated after each successful write.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;

use super::open_conn;

pub const ROLE_COMMON: i64 = 1;
pub const ROLE_ADMIN: i64 = 10;
pub const ROLE_ROOT: i64 = 100;

pub const STATUS_ENABLED: i64 = 1;
pub const STATUS_DISABLED: i64 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub role: i64,
    pub status: i64,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub email: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role >= ROLE_ADMIN
    }

    pub fn remaining_quota(&self) -> i64 {
        self.quota - self.used_quota
    }
}

pub fn create(role: i64, group: &str, quota: i64, email: &str) -> AppResult<i64> {
    let conn = open_conn();
    conn.execute(
        "insert into users(role, status, user_group, quota, used_quota, email)
         values(?1, ?2, ?3, ?4, 0, ?5)",
        params![role, STATUS_ENABLED, group, quota, email],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(id: i64) -> AppResult<Option<User>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(
        "select id, role, status, user_group, quota, used_quota, email from users where id = ?1",
    )?;
    let user = stmt
        .query_row(params![id], |row| {
            Ok(User {
                id: row.get(0)?,
                role: row.get(1)?,
                status: row.get(2)?,
                group: row.get(3)?,
                quota: row.get(4)?,
                used_quota: row.get(5)?,
                email: row.get(6)?,
            })
        })
        .optional()?;
    Ok(user)
}

/// Consume `amount` quota units. Returns false when the user lacks the
/// balance; used_quota never exceeds quota.
pub fn consume_quota(id: i64, amount: i64) -> AppResult<bool> {
    if amount <= 0 {
        if amount < 0 {
            refund_quota(id, -amount)?;
        }
        return Ok(true);
    }
    let conn = open_conn();
    let affected = conn.execute(
        "update users set used_quota = used_quota + ?1
         where id = ?2 and quota - used_quota >= ?1",
        params![amount, id],
    )?;
    if affected > 0 {
        crate::cache::invalidate_user_quota(id);
    }
    Ok(affected > 0)
}

/// Return previously charged quota. Never drives used_quota negative.
pub fn refund_quota(id: i64, amount: i64) -> AppResult<()> {
    if amount <= 0 {
        return Ok(());
    }
    let conn = open_conn();
    conn.execute(
        "update users set used_quota = max(used_quota - ?1, 0) where id = ?2",
        params![amount, id],
    )?;
    crate::cache::invalidate_user_quota(id);
    Ok(())
}

/// Remaining quota, served from the TTL cache when fresh.
pub fn remaining_quota(id: i64) -> AppResult<i64> {
    if let Some(cached) = crate::cache::user_quota(id) {
        return Ok(cached);
    }
    let conn = open_conn();
    let remaining: i64 = conn
        .prepare_cached("select quota - used_quota from users where id = ?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?
        .unwrap_or(0);
    crate::cache::set_user_quota(id, remaining);
    Ok(remaining)
}

/// Grant quota, recorded as a top-up by the caller.
pub fn grant_quota(id: i64, amount: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update users set quota = quota + ?1 where id = ?2",
        params![amount, id],
    )?;
    crate::cache::invalidate_user_quota(id);
    Ok(())
}
