//! Channel health monitor
//!
//! Success and failure events flow through bounded queues into a consumer
//! task that keeps a sliding window of recent outcomes per channel. A
//! channel whose success rate drops strictly below the threshold is
//! auto-disabled (when enabled in config). A separate probe loop runs a
//! canned test prompt and re-enables recovered channels.

use once_cell::sync::OnceCell;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::relay::context::{Dialect, RelayContext, RelayMode};
use crate::store::{channels, logs, tokens::Token, users::User};
use crate::{adapters, cache, config, logger, store};

static SUCCESS_TX: OnceCell<mpsc::Sender<i64>> = OnceCell::new();
static FAILURE_TX: OnceCell<mpsc::Sender<i64>> = OnceCell::new();

/// Sliding window of the last N outcomes for one channel.
pub(crate) struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl OutcomeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.outcomes.len() == self.capacity
    }

    pub(crate) fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        successes as f64 / self.outcomes.len() as f64
    }

    /// Auto-disable fires only on a full window strictly below threshold.
    pub(crate) fn should_disable(&self, threshold: f64) -> bool {
        self.is_full() && self.success_rate() < threshold
    }
}

/// Spawn the consumer task. Queue capacities come from configuration; a
/// full queue drops the event rather than blocking a request handler.
pub fn init() {
    let cfg = config::load();
    let (success_tx, mut success_rx) = mpsc::channel::<i64>(cfg.success_queue_size.max(1));
    let (failure_tx, mut failure_rx) = mpsc::channel::<i64>(cfg.failure_queue_size.max(1));

    if SUCCESS_TX.set(success_tx).is_err() || FAILURE_TX.set(failure_tx).is_err() {
        return;
    }

    tokio::spawn(async move {
        let mut windows: HashMap<i64, OutcomeWindow> = HashMap::new();
        loop {
            let (channel_id, success) = tokio::select! {
                Some(id) = success_rx.recv() => (id, true),
                Some(id) = failure_rx.recv() => (id, false),
                else => break,
            };
            consume_event(&mut windows, channel_id, success);
        }
    });
}

fn consume_event(windows: &mut HashMap<i64, OutcomeWindow>, channel_id: i64, success: bool) {
    let cfg = config::load();
    let window = windows
        .entry(channel_id)
        .or_insert_with(|| OutcomeWindow::new(cfg.monitor_window));
    window.push(success);

    if !cfg.auto_disable_channel || !window.should_disable(cfg.disable_threshold) {
        return;
    }

    match channels::set_status(channel_id, channels::STATUS_AUTO_DISABLED) {
        Ok(true) => {
            let detail = format!(
                "Channel {} auto-disabled: success rate {:.2} below threshold {:.2}",
                channel_id,
                window.success_rate(),
                cfg.disable_threshold
            );
            logger::warn("monitor", &detail);
            let _ = logs::record_system(0, &detail);
        }
        Ok(false) => {}
        Err(e) => {
            logger::error(
                "monitor",
                &format!("Failed to auto-disable channel {}: {}", channel_id, e),
            );
        }
    }
}

pub fn report_success(channel_id: i64) {
    if let Some(tx) = SUCCESS_TX.get() {
        let _ = tx.try_send(channel_id);
    }
}

pub fn report_failure(channel_id: i64) {
    if let Some(tx) = FAILURE_TX.get() {
        let _ = tx.try_send(channel_id);
    }
}

// ============================================================================
// Probe loop
// ============================================================================

fn test_context(channel: &channels::Channel, model: &str) -> RelayContext {
    RelayContext {
        request_id: format!("chantest-{}", uuid::Uuid::new_v4().simple()),
        trace_id: String::new(),
        dialect: Dialect::Chat,
        mode: RelayMode::Chat,
        token: Token {
            id: 0,
            user_id: 0,
            name: "channel-test".to_string(),
            key: String::new(),
            status: store::tokens::STATUS_ENABLED,
            remain_quota: 0,
            used_quota: 0,
            unlimited_quota: true,
            models: String::new(),
            channel_pin: None,
            expires_at: None,
        },
        user: User {
            id: 0,
            role: store::users::ROLE_ROOT,
            status: store::users::STATUS_ENABLED,
            group: "default".to_string(),
            quota: 0,
            used_quota: 0,
            email: String::new(),
        },
        group: "default".to_string(),
        group_ratio: 1.0,
        original_model: model.to_string(),
        is_streaming: false,
        pinned_channel: None,
        channel: Some(channel.clone()),
        upstream_model: channel.rewrite_model(model),
        claude_conversion: false,
        claude_promoted_tool: None,
        response_api_request: None,
        started_at: Instant::now(),
    }
}

/// Run the canned test prompt against one channel. Results are cached for
/// the probe period so repeated status queries stay idempotent.
pub async fn test_channel(channel: &channels::Channel) -> bool {
    if let Some(cached) = cache::channel_test_result(channel.id) {
        return cached;
    }

    let Some(model) = channel.model_list().into_iter().next() else {
        return false;
    };
    let ctx = test_context(channel, &model);
    let adapter = adapters::for_channel_type(channel.channel_type);

    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 1
    });
    let started = Instant::now();
    let ok = match crate::relay::client::create_client(30) {
        Ok(client) => match adapter.convert_request(&ctx, &body) {
            Ok(converted) => match adapter.do_request(&ctx, &client, &converted).await {
                Ok(attempt) => attempt.response.status().is_success(),
                Err(_) => false,
            },
            Err(_) => false,
        },
        Err(_) => false,
    };
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let _ = channels::record_test_result(channel.id, elapsed_ms);
    let _ = logs::record_test(&logs::UsageRecord {
        channel_id: channel.id,
        model: &model,
        request_id: &ctx.request_id,
        latency_ms: elapsed_ms,
        detail: Some(if ok { "ok" } else { "failed" }),
        ..Default::default()
    });

    let ttl = Duration::from_secs(config::load().channel_test_secs.max(60));
    cache::set_channel_test_result(channel.id, ok, ttl);

    logger::info(
        "monitor",
        &format!(
            "Channel test: id={}, model={}, ok={}, latency={}ms",
            channel.id, model, ok, elapsed_ms
        ),
    );
    ok
}

/// Periodic probe over all channels. A succeeding probe on an
/// auto-disabled channel re-enables it when auto-enable is on.
pub async fn probe_loop() {
    let period = config::load().channel_test_secs;
    if period == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(period));
    loop {
        interval.tick().await;
        let channels = match channels::list_all() {
            Ok(list) => list,
            Err(e) => {
                logger::error("monitor", &format!("Probe loop channel query failed: {}", e));
                continue;
            }
        };
        for channel in channels {
            if channel.status == channels::STATUS_MANUALLY_DISABLED {
                continue;
            }
            let ok = test_channel(&channel).await;
            if ok
                && channel.status == channels::STATUS_AUTO_DISABLED
                && config::load().auto_enable_channel
            {
                if let Ok(true) = channels::set_status(channel.id, channels::STATUS_ENABLED) {
                    let detail = format!("Channel {} re-enabled after successful probe", channel.id);
                    logger::info("monitor", &detail);
                    let _ = logs::record_system(0, &detail);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_tracks_last_n_outcomes() {
        let mut window = OutcomeWindow::new(3);
        window.push(false);
        window.push(false);
        window.push(false);
        assert_eq!(window.success_rate(), 0.0);
        // New successes push the old failures out.
        window.push(true);
        window.push(true);
        window.push(true);
        assert_eq!(window.success_rate(), 1.0);
    }

    #[test]
    fn disable_requires_full_window_and_strict_inequality() {
        let mut window = OutcomeWindow::new(10);
        for _ in 0..9 {
            window.push(false);
        }
        // Nine failures but the window is not yet full.
        assert!(!window.should_disable(0.8));
        window.push(false);
        assert!(window.should_disable(0.8));

        // Exactly at threshold: strictly-below means no disable.
        let mut window = OutcomeWindow::new(10);
        for i in 0..10 {
            window.push(i < 8);
        }
        assert_eq!(window.success_rate(), 0.8);
        assert!(!window.should_disable(0.8));
        assert!(window.should_disable(0.81));
    }

    #[test]
    fn auto_disable_transitions_channel_status() {
        let _guard = crate::testutil::setup();
        let id = channels::create(&channels::NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "monitored",
            weight: 1,
            groups: "default",
            models: "monitored-model",
            ..Default::default()
        })
        .unwrap();

        let mut windows = HashMap::new();
        let n = config::load().monitor_window;
        for _ in 0..n {
            consume_event(&mut windows, id, false);
        }
        assert_eq!(
            channels::get_status(id).unwrap(),
            Some(channels::STATUS_AUTO_DISABLED)
        );
    }
}
