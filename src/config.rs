//! Process configuration
//!
//! Settings are read once at start-up from an optional TOML file
//! (`ONE_API_CONFIG`) and then overridden by environment variables. The
//! resulting snapshot lives behind a process-global RW-lock; `load()` hands
//! out cheap clones so hot paths never hold the lock across I/O.

use once_cell::sync::Lazy;
use std::sync::RwLock;
use std::{env, fs, path::PathBuf};

/// Display conversion constant: quota units per 1 USD.
pub const QUOTA_PER_USD: f64 = 500_000.0;

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    /// Listening port for the HTTP server.
    pub port: u16,
    /// Path to the SQLite database. Empty means the platform data directory.
    pub database_path: String,
    /// Optional out-of-process cache backend URL. Recorded for operators;
    /// the in-process TTL cache is always active.
    pub cache_url: Option<String>,
    /// Hard ceiling for a whole relay request, seconds.
    pub relay_timeout_secs: u64,
    /// Soft ceiling between successive SSE frames, seconds.
    pub idle_timeout_secs: u64,
    /// Grace period for graceful shutdown, seconds.
    pub shutdown_timeout_secs: u64,
    /// Minimum quota reserved before calling upstream.
    pub preconsume_quota: i64,
    /// Streaming tracker flush interval, seconds.
    pub flush_interval_secs: u64,
    /// Success-rate threshold below which a channel is auto-disabled.
    pub disable_threshold: f64,
    /// Sliding-window size for the health monitor.
    pub monitor_window: usize,
    /// Bounded queue sizes for monitor events.
    pub success_queue_size: usize,
    pub failure_queue_size: usize,
    /// Per-class ability suspension windows, seconds.
    pub suspend_429_secs: i64,
    pub suspend_5xx_secs: i64,
    pub suspend_auth_secs: i64,
    /// Channel rate-limit sliding window, seconds.
    pub rate_limit_window_secs: u64,
    /// Probe loop period, seconds. Zero disables the probe loop.
    pub channel_test_secs: u64,
    /// Same-request retry cap across channels.
    pub retry_times: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Automatic channel state management.
    pub auto_disable_channel: bool,
    pub auto_enable_channel: bool,
    /// Default group ratio applied when a group has no explicit entry.
    pub default_group_ratio: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            database_path: String::new(),
            cache_url: None,
            relay_timeout_secs: 300,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 10,
            preconsume_quota: 500,
            flush_interval_secs: 3,
            disable_threshold: 0.8,
            monitor_window: 10,
            success_queue_size: 1024,
            failure_queue_size: 128,
            suspend_429_secs: 60,
            suspend_5xx_secs: 30,
            suspend_auth_secs: 60,
            rate_limit_window_secs: 180,
            channel_test_secs: 0,
            retry_times: 3,
            retry_initial_ms: 300,
            retry_max_ms: 3000,
            auto_disable_channel: true,
            auto_enable_channel: true,
            default_group_ratio: 1.0,
        }
    }
}

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(from_environment()));

fn config_file_path() -> Option<PathBuf> {
    env::var("ONE_API_CONFIG").ok().map(PathBuf::from)
}

fn parse_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(value) = raw.trim().parse() {
            *target = value;
        }
    }
}

fn parse_env_bool(key: &str, target: &mut bool) {
    if let Ok(raw) = env::var(key) {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "true" | "1" | "yes" | "on" => *target = true,
            "false" | "0" | "no" | "off" => *target = false,
            _ => {}
        }
    }
}

fn from_environment() -> Settings {
    let mut cfg = match config_file_path() {
        Some(p) if p.exists() => {
            let s = fs::read_to_string(&p).unwrap_or_default();
            toml::from_str(&s).unwrap_or_else(|e| {
                eprintln!("failed to parse config file {:?}: {}", p, e);
                Settings::default()
            })
        }
        _ => Settings::default(),
    };

    parse_env("ONE_API_PORT", &mut cfg.port);
    if let Ok(path) = env::var("ONE_API_DATABASE") {
        cfg.database_path = path;
    }
    if let Ok(url) = env::var("ONE_API_CACHE_URL") {
        if !url.trim().is_empty() {
            cfg.cache_url = Some(url);
        }
    }
    parse_env("ONE_API_RELAY_TIMEOUT_SECS", &mut cfg.relay_timeout_secs);
    parse_env("ONE_API_IDLE_TIMEOUT_SECS", &mut cfg.idle_timeout_secs);
    parse_env(
        "ONE_API_SHUTDOWN_TIMEOUT_SECS",
        &mut cfg.shutdown_timeout_secs,
    );
    parse_env("ONE_API_PRECONSUME_QUOTA", &mut cfg.preconsume_quota);
    parse_env("ONE_API_FLUSH_INTERVAL_SECS", &mut cfg.flush_interval_secs);
    parse_env("ONE_API_DISABLE_THRESHOLD", &mut cfg.disable_threshold);
    parse_env("ONE_API_MONITOR_WINDOW", &mut cfg.monitor_window);
    parse_env("ONE_API_SUCCESS_QUEUE", &mut cfg.success_queue_size);
    parse_env("ONE_API_FAILURE_QUEUE", &mut cfg.failure_queue_size);
    parse_env("ONE_API_SUSPEND_429_SECS", &mut cfg.suspend_429_secs);
    parse_env("ONE_API_SUSPEND_5XX_SECS", &mut cfg.suspend_5xx_secs);
    parse_env("ONE_API_SUSPEND_AUTH_SECS", &mut cfg.suspend_auth_secs);
    parse_env(
        "ONE_API_RATE_LIMIT_WINDOW_SECS",
        &mut cfg.rate_limit_window_secs,
    );
    parse_env("ONE_API_CHANNEL_TEST_SECS", &mut cfg.channel_test_secs);
    parse_env("ONE_API_RETRY_TIMES", &mut cfg.retry_times);
    parse_env("ONE_API_RETRY_INITIAL_MS", &mut cfg.retry_initial_ms);
    parse_env("ONE_API_RETRY_MAX_MS", &mut cfg.retry_max_ms);
    parse_env_bool("ONE_API_AUTO_DISABLE", &mut cfg.auto_disable_channel);
    parse_env_bool("ONE_API_AUTO_ENABLE", &mut cfg.auto_enable_channel);
    parse_env("ONE_API_DEFAULT_GROUP_RATIO", &mut cfg.default_group_ratio);

    cfg
}

/// Current settings snapshot.
pub fn load() -> Settings {
    SETTINGS.read().unwrap().clone()
}

/// Replace the process settings. Used by tests and by operators reloading
/// configuration without a restart.
pub fn replace(cfg: Settings) {
    *SETTINGS.write().unwrap() = cfg;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Settings::default();
        assert_eq!(cfg.flush_interval_secs, 3);
        assert_eq!(cfg.suspend_429_secs, 60);
        assert_eq!(cfg.suspend_5xx_secs, 30);
        assert_eq!(cfg.suspend_auth_secs, 60);
        assert_eq!(cfg.monitor_window, 10);
        assert_eq!(cfg.success_queue_size, 1024);
        assert_eq!(cfg.failure_queue_size, 128);
    }

    #[test]
    fn toml_roundtrip_keeps_fields() {
        let cfg = Settings::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.retry_times, cfg.retry_times);
    }
}
