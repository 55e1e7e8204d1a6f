//! Options table
//!
//! Free-form key/value pairs for runtime-tunable settings (group ratios,
//! global pricing fallbacks). Reads go through the TTL cache; writes update
//! the row and drop the cached map.

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

use crate::error::AppResult;

use super::open_conn;

pub fn get(key: &str) -> AppResult<Option<String>> {
    if let Some(map) = crate::cache::option_map() {
        return Ok(map.get(key).cloned());
    }
    let map = load_all()?;
    let value = map.get(key).cloned();
    crate::cache::set_option_map(map);
    Ok(value)
}

pub fn set(key: &str, value: &str) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "insert into options(key, value) values(?1, ?2)
         on conflict(key) do update set value = excluded.value",
        params![key, value],
    )?;
    crate::cache::invalidate_option_map();
    Ok(())
}

pub fn load_all() -> AppResult<HashMap<String, String>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached("select key, value from options")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Group billing ratio. Stored as `group_ratio:<name>`; missing groups use
/// the configured default.
pub fn group_ratio(group: &str) -> f64 {
    let key = format!("group_ratio:{}", group);
    match get(&key) {
        Ok(Some(raw)) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| crate::config::load().default_group_ratio),
        _ => crate::config::load().default_group_ratio,
    }
}

#[allow(dead_code)]
pub fn delete(key: &str) -> AppResult<bool> {
    let conn = open_conn();
    let affected = conn.execute("delete from options where key = ?1", params![key])?;
    crate::cache::invalidate_option_map();
    Ok(affected > 0)
}

pub fn get_raw(key: &str) -> AppResult<Option<String>> {
    let conn = open_conn();
    let result = conn
        .prepare_cached("select value from options where key = ?1")?
        .query_row(params![key], |row| row.get(0))
        .optional()?;
    Ok(result)
}
