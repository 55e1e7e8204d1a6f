//! Ability rows
//!
//! One row per (channel, model, group) tuple. Priority and weight are
//! denormalised from the channel so the scheduler query is a single scan.
//! Suspension classes each carry their own until-timestamp; last writer
//! wins, which is fine because correctness only needs "not before".

use rusqlite::params;
use serde::Serialize;

use crate::error::AppResult;

use super::{channels::Channel, now_unix, open_conn};

/// Failure class used for suspension feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendClass {
    RateLimited,
    ServerError,
    Auth,
}

impl SuspendClass {
    fn column(&self) -> &'static str {
        match self {
            SuspendClass::RateLimited => "suspend_429_until",
            SuspendClass::ServerError => "suspend_5xx_until",
            SuspendClass::Auth => "suspend_auth_until",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AbilityCandidate {
    pub channel_id: i64,
    pub priority: i64,
    pub weight: i64,
}

/// Drop and recreate the ability rows for a channel from its configured
/// model and group lists.
pub fn rebuild_for_channel(channel: &Channel) -> AppResult<()> {
    let mut conn = open_conn();
    let tx = conn.transaction()?;
    tx.execute(
        "delete from abilities where channel_id = ?1",
        params![channel.id],
    )?;
    for model in channel.model_list() {
        for group in channel.group_list() {
            tx.execute(
                "insert or replace into abilities
                     (channel_id, model, user_group, enabled, priority, weight,
                      suspend_429_until, suspend_5xx_until, suspend_auth_until)
                 values(?1, ?2, ?3, 1, ?4, ?5, 0, 0, 0)",
                params![channel.id, model, group, channel.priority, channel.weight],
            )?;
        }
    }
    tx.commit()?;
    crate::cache::invalidate_abilities();
    Ok(())
}

/// Enabled, unsuspended candidates for (model, group) whose owning channel
/// is enabled with non-negative priority.
pub fn candidates(model: &str, group: &str) -> AppResult<Vec<AbilityCandidate>> {
    let now = now_unix();
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(
        "select a.channel_id, a.priority, a.weight
         from abilities a join channels c on c.id = a.channel_id
         where a.model = ?1 and a.user_group = ?2 and a.enabled = 1
           and a.suspend_429_until <= ?3
           and a.suspend_5xx_until <= ?3
           and a.suspend_auth_until <= ?3
           and c.status = 1 and c.priority >= 0
         order by a.priority desc, a.channel_id asc",
    )?;
    let rows = stmt.query_map(params![model, group, now], |row| {
        Ok(AbilityCandidate {
            channel_id: row.get(0)?,
            priority: row.get(1)?,
            weight: row.get(2)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Write a suspension window on one ability row.
pub fn suspend(
    channel_id: i64,
    model: &str,
    group: &str,
    class: SuspendClass,
    until: i64,
) -> AppResult<()> {
    let conn = open_conn();
    let sql = format!(
        "update abilities set {} = ?1
         where channel_id = ?2 and model = ?3 and user_group = ?4",
        class.column()
    );
    conn.execute(&sql, params![until, channel_id, model, group])?;
    Ok(())
}

/// Suspension expiry for one class, for assertions and the status view.
pub fn suspended_until(
    channel_id: i64,
    model: &str,
    group: &str,
    class: SuspendClass,
) -> AppResult<i64> {
    let conn = open_conn();
    let sql = format!(
        "select {} from abilities
         where channel_id = ?1 and model = ?2 and user_group = ?3",
        class.column()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt
        .query_row(params![channel_id, model, group], |row| row.get(0))
        .unwrap_or(0))
}

pub fn set_enabled(channel_id: i64, model: &str, group: &str, enabled: bool) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update abilities set enabled = ?1
         where channel_id = ?2 and model = ?3 and user_group = ?4",
        params![enabled as i64, channel_id, model, group],
    )?;
    crate::cache::invalidate_abilities();
    Ok(())
}

/// Distinct logical model names with at least one enabled ability for the
/// given group; feeds the scoped model-display endpoint.
pub fn models_for_group(group: &str) -> AppResult<Vec<String>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(
        "select distinct a.model
         from abilities a join channels c on c.id = a.channel_id
         where a.user_group = ?1 and a.enabled = 1 and c.status = 1
         order by a.model",
    )?;
    let rows = stmt.query_map(params![group], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Every distinct model name any enabled channel serves.
pub fn all_models() -> AppResult<Vec<String>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(
        "select distinct a.model
         from abilities a join channels c on c.id = a.channel_id
         where a.enabled = 1 and c.status = 1
         order by a.model",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}
