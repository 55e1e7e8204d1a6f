//! In-process cache
//!
//! A keyed TTL map plus the per-channel sliding rate-limit windows. Entries
//! are best-effort: the database stays authoritative and callers must
//! tolerate stale reads. The `cache_url` setting reserves a slot for an
//! out-of-process backend with the same interface.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const USER_QUOTA_TTL: Duration = Duration::from_secs(30);
const OPTION_MAP_TTL: Duration = Duration::from_secs(60);
const ABILITY_TTL: Duration = Duration::from_secs(30);

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    rate_windows: HashMap<i64, VecDeque<Instant>>,
}

static CACHE: Lazy<Mutex<CacheState>> = Lazy::new(|| Mutex::new(CacheState::default()));

fn get_string(key: &str) -> Option<String> {
    let mut state = CACHE.lock().unwrap();
    match state.entries.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
        Some(_) => {
            state.entries.remove(key);
            None
        }
        None => None,
    }
}

fn set_string(key: &str, value: String, ttl: Duration) {
    let mut state = CACHE.lock().unwrap();
    state.entries.insert(
        key.to_string(),
        Entry {
            value,
            expires_at: Instant::now() + ttl,
        },
    );
}

fn remove(key: &str) {
    let mut state = CACHE.lock().unwrap();
    state.entries.remove(key);
}

// ============================================================================
// User quota
// ============================================================================

pub fn user_quota(user_id: i64) -> Option<i64> {
    get_string(&format!("user_quota:{}", user_id)).and_then(|v| v.parse().ok())
}

pub fn set_user_quota(user_id: i64, remaining: i64) {
    set_string(
        &format!("user_quota:{}", user_id),
        remaining.to_string(),
        USER_QUOTA_TTL,
    );
}

pub fn invalidate_user_quota(user_id: i64) {
    remove(&format!("user_quota:{}", user_id));
}

// ============================================================================
// Option map
// ============================================================================

pub fn option_map() -> Option<HashMap<String, String>> {
    get_string("option_map").and_then(|raw| serde_json::from_str(&raw).ok())
}

pub fn set_option_map(map: HashMap<String, String>) {
    if let Ok(raw) = serde_json::to_string(&map) {
        set_string("option_map", raw, OPTION_MAP_TTL);
    }
}

pub fn invalidate_option_map() {
    remove("option_map");
}

// ============================================================================
// Ability lists
// ============================================================================

pub fn invalidate_abilities() {
    let mut state = CACHE.lock().unwrap();
    state.entries.retain(|key, _| !key.starts_with("abilities:"));
}

pub fn cached_models_for_group(group: &str) -> Option<Vec<String>> {
    get_string(&format!("abilities:models:{}", group)).and_then(|raw| {
        serde_json::from_str(&raw).ok()
    })
}

pub fn set_models_for_group(group: &str, models: &[String]) {
    if let Ok(raw) = serde_json::to_string(models) {
        set_string(&format!("abilities:models:{}", group), raw, ABILITY_TTL);
    }
}

// ============================================================================
// Channel test results
// ============================================================================

pub fn channel_test_result(channel_id: i64) -> Option<bool> {
    get_string(&format!("channel_test:{}", channel_id)).map(|v| v == "ok")
}

pub fn set_channel_test_result(channel_id: i64, ok: bool, ttl: Duration) {
    set_string(
        &format!("channel_test:{}", channel_id),
        if ok { "ok" } else { "failed" }.to_string(),
        ttl,
    );
}

// ============================================================================
// Rate-limit windows
// ============================================================================

/// Record one request against the channel's sliding window. Returns false
/// when the window already holds `limit` entries.
pub fn rate_limit_acquire(channel_id: i64, limit: i64, window: Duration) -> bool {
    if limit <= 0 {
        return true;
    }
    let mut state = CACHE.lock().unwrap();
    let entries = state.rate_windows.entry(channel_id).or_default();
    let cutoff = Instant::now() - window;
    while matches!(entries.front(), Some(ts) if *ts < cutoff) {
        entries.pop_front();
    }
    if entries.len() as i64 >= limit {
        return false;
    }
    entries.push_back(Instant::now());
    true
}

#[cfg(test)]
pub fn reset_rate_window(channel_id: i64) {
    let mut state = CACHE.lock().unwrap();
    state.rate_windows.remove(&channel_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_dropped() {
        set_string("t:expiry", "1".to_string(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(get_string("t:expiry"), None);
    }

    #[test]
    fn rate_window_enforces_limit() {
        reset_rate_window(991);
        let window = Duration::from_secs(60);
        assert!(rate_limit_acquire(991, 2, window));
        assert!(rate_limit_acquire(991, 2, window));
        assert!(!rate_limit_acquire(991, 2, window));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        reset_rate_window(992);
        for _ in 0..100 {
            assert!(rate_limit_acquire(992, 0, Duration::from_secs(60)));
        }
    }
}
