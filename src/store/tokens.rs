//! API token rows
//!
//! Keys are `sk-` prefixed random strings. A token may carry its own quota
//! or be unlimited; either way the owning user's quota is the hard ceiling.

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;

use super::open_conn;

pub const STATUS_ENABLED: i64 = 1;
pub const STATUS_DISABLED: i64 = 2;
pub const STATUS_EXPIRED: i64 = 3;
pub const STATUS_EXHAUSTED: i64 = 4;

pub const KEY_PREFIX: &str = "sk-";

#[derive(Debug, Clone, Serialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub key: String,
    pub status: i64,
    pub remain_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
    /// Comma-separated allow-list; empty means inherit from the group.
    pub models: String,
    pub channel_pin: Option<i64>,
    pub expires_at: Option<i64>,
}

impl Token {
    pub fn allows_model(&self, model: &str) -> bool {
        if self.models.trim().is_empty() {
            return true;
        }
        self.models
            .split(',')
            .any(|m| m.trim().eq_ignore_ascii_case(model))
    }
}

pub fn generate_key() -> String {
    let suffix: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    format!("{}{}", KEY_PREFIX, suffix)
}

pub struct NewToken<'a> {
    pub user_id: i64,
    pub name: &'a str,
    pub quota: i64,
    pub unlimited: bool,
    pub models: &'a str,
    pub channel_pin: Option<i64>,
    pub expires_at: Option<i64>,
}

pub fn create(input: &NewToken) -> AppResult<(i64, String)> {
    let key = generate_key();
    let conn = open_conn();
    conn.execute(
        "insert into tokens(user_id, name, key, status, remain_quota, used_quota,
                            unlimited_quota, models, channel_pin, expires_at)
         values(?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9)",
        params![
            input.user_id,
            input.name,
            key,
            STATUS_ENABLED,
            input.quota,
            input.unlimited as i64,
            input.models,
            input.channel_pin,
            input.expires_at
        ],
    )?;
    Ok((conn.last_insert_rowid(), key))
}

fn row_to_token(row: &rusqlite::Row) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        key: row.get(3)?,
        status: row.get(4)?,
        remain_quota: row.get(5)?,
        used_quota: row.get(6)?,
        unlimited_quota: row.get::<_, i64>(7)? != 0,
        models: row.get(8)?,
        channel_pin: row.get(9)?,
        expires_at: row.get(10)?,
    })
}

const TOKEN_COLUMNS: &str = "id, user_id, name, key, status, remain_quota, used_quota, \
                             unlimited_quota, models, channel_pin, expires_at";

pub fn get_by_key(key: &str) -> AppResult<Option<Token>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from tokens where key = ?1",
        TOKEN_COLUMNS
    ))?;
    Ok(stmt.query_row(params![key], row_to_token).optional()?)
}

pub fn get(id: i64) -> AppResult<Option<Token>> {
    let conn = open_conn();
    let mut stmt = conn.prepare_cached(&format!(
        "select {} from tokens where id = ?1",
        TOKEN_COLUMNS
    ))?;
    Ok(stmt.query_row(params![id], row_to_token).optional()?)
}

/// Consume quota from the token. Unlimited tokens only accumulate usage.
pub fn consume_quota(id: i64, amount: i64) -> AppResult<bool> {
    if amount <= 0 {
        if amount < 0 {
            refund_quota(id, -amount)?;
        }
        return Ok(true);
    }
    let conn = open_conn();
    let affected = conn.execute(
        "update tokens set
             used_quota = used_quota + ?1,
             remain_quota = case when unlimited_quota != 0
                            then remain_quota else remain_quota - ?1 end
         where id = ?2 and (unlimited_quota != 0 or remain_quota >= ?1)",
        params![amount, id],
    )?;
    Ok(affected > 0)
}

pub fn refund_quota(id: i64, amount: i64) -> AppResult<()> {
    if amount <= 0 {
        return Ok(());
    }
    let conn = open_conn();
    conn.execute(
        "update tokens set
             used_quota = max(used_quota - ?1, 0),
             remain_quota = case when unlimited_quota != 0
                            then remain_quota else remain_quota + ?1 end
         where id = ?2",
        params![amount, id],
    )?;
    Ok(())
}

pub fn set_status(id: i64, status: i64) -> AppResult<()> {
    let conn = open_conn();
    conn.execute(
        "update tokens set status = ?1 where id = ?2",
        params![status, id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_prefixed_and_distinct() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with(KEY_PREFIX));
        assert_eq!(a.len(), KEY_PREFIX.len() + 48);
        assert_ne!(a, b);
    }

    #[test]
    fn model_allow_list() {
        let mut token = Token {
            id: 1,
            user_id: 1,
            name: String::new(),
            key: String::new(),
            status: STATUS_ENABLED,
            remain_quota: 0,
            used_quota: 0,
            unlimited_quota: false,
            models: String::new(),
            channel_pin: None,
            expires_at: None,
        };
        assert!(token.allows_model("gpt-4o-mini"));
        token.models = "gpt-4o, claude-sonnet-4-0".to_string();
        assert!(token.allows_model("GPT-4o"));
        assert!(!token.allows_model("gpt-4o-mini"));
    }
}
