//! Channel rows
//!
//! A channel binds an adapter family (numeric type) to a base URL and
//! credentials, with routing metadata: groups, model allow-list, priority,
//! weight, rewrite map and pricing overrides. Status transitions are driven
//! by admins and by the health monitor.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::AppResult;

use super::{now_unix, open_conn};

pub const STATUS_ENABLED: i64 = 1;
pub const STATUS_MANUALLY_DISABLED: i64 = 2;
pub const STATUS_AUTO_DISABLED: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: i64,
    pub name: String,
    pub status: i64,
    /// Negative priority pauses the channel without disabling it.
    pub priority: i64,
    pub weight: i64,
    /// Comma-separated group names this channel serves.
    pub groups: String,
    /// Comma-separated logical model names this channel serves.
    pub models: String,
    pub base_url: String,
    pub key: String,
    /// JSON object: logical model name -> provider model name.
    pub model_mapping: Option<String>,
    /// JSON object: model -> pricing record override.
    pub price_overrides: Option<String>,
    /// JSON object: model -> completion ratio override.
    pub completion_ratio_overrides: Option<String>,
    /// Requests allowed per rate-limit window; None = unlimited.
    pub rate_limit: Option<i64>,
    pub disable_structured_output: bool,
    pub balance: f64,
    pub balance_updated_at: Option<i64>,
    pub test_at: Option<i64>,
    pub response_time_ms: Option<i64>,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }

    pub fn group_list(&self) -> Vec<String> {
        self.groups
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect()
    }

    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Resolve a logical model name to the provider-specific name. The
    /// logical name is what gets logged; the rewrite applies upstream only.
    pub fn rewrite_model(&self, model: &str) -> String {
        if let Some(raw) = self.model_mapping.as_deref() {
            if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(raw) {
                if let Some(mapped) = map.get(model) {
                    if !mapped.trim().is_empty() {
                        return mapped.clone();
                    }
                }
            }
        }
        model.to_string()
    }

    pub fn price_override_for(&self, model: &str) -> Option<Value> {
        let raw = self.price_overrides.as_deref()?;
        let map: HashMap<String, Value> = serde_json::from_str(raw).ok()?;
        map.get(model).cloned()
    }

    pub fn completion_ratio_override_for(&self, model: &str) -> Option<f64> {
        let raw = self.completion_ratio_overrides.as_deref()?;
        let map: HashMap<String, f64> = serde_json::from_str(raw).ok()?;
        map.get(model).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewChannel<'a> {
    pub channel_type: i64,
    pub name: &'a str,
    pub priority: i64,
    pub weight: i64,
    pub groups: &'a str,
    pub models: &'a str,
    pub base_url: &'a str,
    pub key: &'a str,
    pub model_mapping: Option<&'a str>,
    pub price_overrides: Option<&'a str>,
    pub completion_ratio_overrides: Option<&'a str>,
    pub rate_limit: Option<i64>,
    pub disable_structured_output: bool,
}

const CHANNEL_COLUMNS: &str = "id, channel_type, name, status, priority, weight, groups, models, \
     base_url, key, model_mapping, price_overrides, completion_ratio_overrides, rate_limit, \
     disable_structured_output, balance, balance_updated_at, test_at, response_time_ms";

fn row_to_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        channel_type: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        weight: row.get(5)?,
        groups: row.get(6)?,
        models: row.get(7)?,
        base_url: row.get(8)?,
        key: row.get(9)?,
        model_mapping: row.get(10)?,
        price_overrides: row.get(11)?,
        completion_ratio_overrides: row.get(12)?,
        rate_limit: row.get(13)?,
        disable_structured_output: row.get::<_, i64>(14)? != 0,
        balance: row.get(15)?,
        balance_updated_at: row.get(16)?,
        test_at: row.get(17)?,
        response_time_ms: row.get(18)?,
    })
}

/// Insert a channel and materialise its ability rows.
pub fn create(input: &NewChannel) -> AppResult<i64> {
    let conn = open_conn();
    conn.execute(
        "insert into channels(channel_type, name, status, priority, weight, groups, models,
                              base_url, key, model_mapping, price_overrides,
                              completion_ratio_overrides, rate_limit, disable_structured_output)
         values(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            input.channel_type,
            input.name,
            STATUS_ENABLED,
            input.priority,
            input.weight,
            input.groups,
            input.models,
            input.base_url,
            input.key,
            input.model_mapping,
            input.price_overrides,
            input.completion_ratio_overrides,
            input.rate_limit,
            input.disable_structured_output as i64,
        ],
    )?;
    let id = conn.last_insert_rowid();
    drop(conn);

    if let Some(channel) = get(id)? {
        super::abilities::rebuild_for_channel(&channel)?;
    }
    Ok(id)
}

pub fn get(id: i64) -> AppResult<Option<Channel>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from channels where id = ?1",
        CHANNEL_COLUMNS
    ))?;
    Ok(stmt.query_row(params![id], row_to_channel).optional()?)
}

pub fn set_status(id: i64, status: i64) -> AppResult<bool> {
    let conn = open_conn();
    let affected = conn.execute(
        "update channels set status = ?1 where id = ?2 and status != ?1",
        params![status, id],
    )?;
    Ok(affected > 0)
}

pub fn get_status(id: i64) -> AppResult<Option<i64>> {
    let conn = open_conn();
    let result = conn
        .prepare_cached("select status from channels where id = ?1")?
        .query_row(params![id], |row| row.get(0))
        .optional()?;
    Ok(result)
}

pub fn record_test_result(id: i64, response_time_ms: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update channels set test_at = ?1, response_time_ms = ?2 where id = ?3",
        params![now_unix(), response_time_ms, id],
    )?;
    Ok(())
}

pub fn update_balance(id: i64, balance: f64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update channels set balance = ?1, balance_updated_at = ?2 where id = ?3",
        params![balance, now_unix(), id],
    )?;
    Ok(())
}

pub fn list_all() -> AppResult<Vec<Channel>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from channels order by id",
        CHANNEL_COLUMNS
    ))?;
    let rows = stmt.query_map([], row_to_channel)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Paginated channel health view for the status endpoint.
pub fn list_page(page: i64, size: i64) -> AppResult<(Vec<Channel>, i64)> {
    let conn = open_conn();
    let total: i64 = conn
        .prepare_cached("select count(*) from channels")?
        .query_row([], |row| row.get(0))?;
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from channels order by id limit ?1 offset ?2",
        CHANNEL_COLUMNS
    ))?;
    let offset = (page.max(1) - 1) * size;
    let rows = stmt.query_map(params![size, offset], row_to_channel)?;
    Ok((rows.filter_map(|r| r.ok()).collect(), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel() -> Channel {
        Channel {
            id: 7,
            channel_type: 1,
            name: "test".into(),
            status: STATUS_ENABLED,
            priority: 0,
            weight: 1,
            groups: "default, vip".into(),
            models: "gpt-4o-mini, gpt-4o".into(),
            base_url: String::new(),
            key: String::new(),
            model_mapping: Some(r#"{"gpt-4o-mini":"gpt-4o-mini-2024"}"#.into()),
            price_overrides: None,
            completion_ratio_overrides: Some(r#"{"gpt-4o":3.5}"#.into()),
            rate_limit: None,
            disable_structured_output: false,
            balance: 0.0,
            balance_updated_at: None,
            test_at: None,
            response_time_ms: None,
        }
    }

    #[test]
    fn rewrite_only_applies_to_mapped_models() {
        let ch = sample_channel();
        assert_eq!(ch.rewrite_model("gpt-4o-mini"), "gpt-4o-mini-2024");
        assert_eq!(ch.rewrite_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn list_parsing_trims_entries() {
        let ch = sample_channel();
        assert_eq!(ch.group_list(), vec!["default", "vip"]);
        assert_eq!(ch.model_list(), vec!["gpt-4o-mini", "gpt-4o"]);
        assert_eq!(ch.completion_ratio_override_for("gpt-4o"), Some(3.5));
        assert_eq!(ch.completion_ratio_override_for("gpt-4o-mini"), None);
    }
}
