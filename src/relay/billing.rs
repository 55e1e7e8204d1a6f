//! Pre-consumption, streaming quota tracking, reconciliation
//!
//! Billing happens in three acts. A reservation is taken before the first
//! upstream byte; a streaming tracker charges incrementally as deltas
//! arrive; one reconciliation entry settles the difference (possibly a
//! refund) once authoritative usage is known. The identity maintained per
//! request: pre-consumption + flushed charges + reconcile delta equals the
//! recorded quota.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::pricing::{self, ModelPrice, Usage};
use crate::store::{tokens, users};
use crate::{config, logger};

use super::error::{RelayError, RelayResult};

/// Reserve quota before calling upstream. The reservation is the larger of
/// the configured floor and the estimated prompt cost.
pub fn pre_consume(
    token_id: i64,
    user_id: i64,
    estimated_prompt_tokens: i64,
    price: &ModelPrice,
    group_ratio: f64,
) -> RelayResult<i64> {
    let cfg = config::load();
    let approx = pricing::approx_prompt_quota(estimated_prompt_tokens, price, group_ratio);
    let amount = cfg.preconsume_quota.max(approx);
    if amount <= 0 {
        return Ok(0);
    }

    charge(token_id, user_id, amount).map_err(|e| {
        logger::info(
            "billing",
            &format!(
                "Pre-consumption rejected: token={}, amount={}",
                token_id, amount
            ),
        );
        e
    })?;
    Ok(amount)
}

/// Atomically charge token then user; rolls the token back if the user
/// lacks balance.
fn charge(token_id: i64, user_id: i64, amount: i64) -> RelayResult<()> {
    let token_ok =
        tokens::consume_quota(token_id, amount).map_err(|e| RelayError::Internal(e.to_string()))?;
    if !token_ok {
        return Err(RelayError::InsufficientQuota(
            "Token quota exhausted".to_string(),
        ));
    }
    let user_ok =
        users::consume_quota(user_id, amount).map_err(|e| RelayError::Internal(e.to_string()))?;
    if !user_ok {
        let _ = tokens::refund_quota(token_id, amount);
        return Err(RelayError::InsufficientQuota(
            "User quota exhausted".to_string(),
        ));
    }
    Ok(())
}

fn refund(token_id: i64, user_id: i64, amount: i64) {
    if amount <= 0 {
        return;
    }
    let _ = tokens::refund_quota(token_id, amount);
    let _ = users::refund_quota(user_id, amount);
}

/// Settle the difference between the authoritative total and everything
/// charged so far. Returns the delta that was applied (negative = refund).
/// A positive delta that no longer fits the user's balance charges whatever
/// remains; the log row still records the true total.
pub fn reconcile(token_id: i64, user_id: i64, total: i64, already_charged: i64) -> i64 {
    let delta = total - already_charged;
    if delta > 0 {
        if charge(token_id, user_id, delta).is_err() {
            let remaining = users::remaining_quota(user_id).unwrap_or(0).max(0);
            let partial = remaining.min(delta);
            if partial > 0 && charge(token_id, user_id, partial).is_ok() {
                logger::warn(
                    "billing",
                    &format!(
                        "Reconciliation clamped to remaining quota: user={}, wanted={}, charged={}",
                        user_id, delta, partial
                    ),
                );
                return partial;
            }
            logger::warn(
                "billing",
                &format!(
                    "Reconciliation could not charge delta: user={}, wanted={}",
                    user_id, delta
                ),
            );
            return 0;
        }
    } else if delta < 0 {
        refund(token_id, user_id, -delta);
    }
    delta
}

struct TrackerState {
    running: Usage,
    final_usage: Option<Usage>,
    charged: i64,
    last_flush: Instant,
    exhausted: bool,
}

/// Incremental billing for one streaming response.
///
/// Deltas accumulate between cooperative flushes; each flush charges the
/// difference between the computed target and what is already charged, so
/// `charged_so_far` is monotonic under the internal mutex.
pub struct StreamQuotaTracker {
    token_id: i64,
    user_id: i64,
    price: ModelPrice,
    group_ratio: f64,
    pre_consumed: i64,
    tools_cost: i64,
    flush_interval: Duration,
    state: Mutex<TrackerState>,
}

impl StreamQuotaTracker {
    pub fn new(
        token_id: i64,
        user_id: i64,
        price: ModelPrice,
        group_ratio: f64,
        pre_consumed: i64,
        estimated_prompt_tokens: i64,
    ) -> Self {
        Self {
            token_id,
            user_id,
            price,
            group_ratio,
            pre_consumed,
            tools_cost: 0,
            flush_interval: Duration::from_secs(config::load().flush_interval_secs),
            state: Mutex::new(TrackerState {
                running: Usage {
                    prompt_tokens: estimated_prompt_tokens,
                    ..Usage::default()
                },
                final_usage: None,
                charged: 0,
                last_flush: Instant::now(),
                exhausted: false,
            }),
        }
    }

    /// Record completion-token deltas as they stream by.
    pub fn record_completion(&self, tokens: i64) {
        let mut state = self.state.lock().unwrap();
        state.running.completion_tokens += tokens.max(0);
    }

    /// Override the running estimate with authoritative upstream counts.
    pub fn set_final_usage(&self, usage: Usage) {
        let mut state = self.state.lock().unwrap();
        state.final_usage = Some(usage);
    }

    pub fn charged_so_far(&self) -> i64 {
        self.state.lock().unwrap().charged
    }

    pub fn total_charged(&self) -> i64 {
        self.pre_consumed + self.charged_so_far()
    }

    pub fn current_usage(&self) -> Usage {
        let state = self.state.lock().unwrap();
        state.final_usage.unwrap_or(state.running)
    }

    /// Flush when the interval has elapsed. Cheap when it hasn't.
    pub fn maybe_flush(&self) -> RelayResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.last_flush.elapsed() < self.flush_interval {
                return Ok(());
            }
        }
        self.flush()
    }

    /// Charge the delta between the computed target and charges so far.
    ///
    /// On a failed user-quota check the tracker marks itself exhausted and
    /// returns `quota_exceeded`; the stream loop cancels upstream and emits
    /// a terminal error frame.
    pub fn flush(&self) -> RelayResult<()> {
        let (delta, usage) = {
            let mut state = self.state.lock().unwrap();
            if state.exhausted {
                return Err(RelayError::InsufficientQuota(
                    "Quota exhausted mid-stream".to_string(),
                ));
            }
            state.last_flush = Instant::now();
            let mut usage = state.final_usage.unwrap_or(state.running);
            usage.tools_cost = self.tools_cost;
            let target =
                pricing::compute_quota(&usage, &self.price, self.group_ratio).total
                    - self.pre_consumed;
            let delta = target - state.charged;
            if delta <= 0 {
                return Ok(());
            }
            // Optimistically advance; rolled back below on failure so the
            // observable value stays monotonic.
            state.charged += delta;
            (delta, usage)
        };

        match charge(self.token_id, self.user_id, delta) {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.charged -= delta;
                state.exhausted = true;
                logger::warn(
                    "billing",
                    &format!(
                        "Mid-stream quota exhaustion: user={}, completion_tokens={}",
                        self.user_id, usage.completion_tokens
                    ),
                );
                Err(e)
            }
        }
    }

    /// Final flush on stream end or cancellation: adopt authoritative
    /// usage if present and settle one last time. Exhaustion here is not an
    /// error; the stream is already over.
    pub fn final_flush(&self) -> Usage {
        let _ = self.flush();
        self.current_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use crate::testutil;

    fn flat_price() -> ModelPrice {
        // 2 USD per 1M tokens = 1 quota unit per token.
        ModelPrice {
            ratio: 2.0,
            completion_ratio: 1.0,
            cached_input_ratio: -1.0,
            cache_write_5m_ratio: 0.0,
            cache_write_1h_ratio: 0.0,
            image_price_usd: None,
        }
    }

    fn seed_user_and_token(quota: i64) -> (i64, i64) {
        let user_id = store::users::create(store::users::ROLE_COMMON, "default", quota, "").unwrap();
        let (token_id, _) = store::tokens::create(&store::tokens::NewToken {
            user_id,
            name: "billing-test",
            quota,
            unlimited: false,
            models: "",
            channel_pin: None,
            expires_at: None,
        })
        .unwrap();
        (user_id, token_id)
    }

    #[test]
    fn pre_consume_reserves_the_larger_amount() {
        let _guard = testutil::setup();
        let (user_id, token_id) = seed_user_and_token(100_000);

        let reserved = pre_consume(token_id, user_id, 2000, &flat_price(), 1.0).unwrap();
        // 2000 tokens at 1 unit each beats the configured floor of 500.
        assert_eq!(reserved, 2000);
        assert_eq!(store::users::remaining_quota(user_id).unwrap(), 98_000);
    }

    #[test]
    fn pre_consume_rejects_poor_token() {
        let _guard = testutil::setup();
        let (user_id, token_id) = seed_user_and_token(100);

        let err = pre_consume(token_id, user_id, 2000, &flat_price(), 1.0).unwrap_err();
        assert!(matches!(err, RelayError::InsufficientQuota(_)));
        // Nothing sticks after the rejection.
        assert_eq!(store::users::remaining_quota(user_id).unwrap(), 100);
    }

    #[test]
    fn reconcile_delta_equals_total_minus_charged() {
        let _guard = testutil::setup();
        let (user_id, token_id) = seed_user_and_token(50_000);

        // Over-reserved: refund flows back.
        charge(token_id, user_id, 1000).unwrap();
        let delta = reconcile(token_id, user_id, 700, 1000);
        assert_eq!(delta, -300);
        assert_eq!(store::users::remaining_quota(user_id).unwrap(), 49_300);

        // Under-reserved: the difference is charged.
        let delta = reconcile(token_id, user_id, 900, 700);
        assert_eq!(delta, 200);
        assert_eq!(store::users::remaining_quota(user_id).unwrap(), 49_100);
    }

    #[test]
    fn tracker_charges_monotonically() {
        let _guard = testutil::setup();
        let (user_id, token_id) = seed_user_and_token(100_000);

        let tracker = StreamQuotaTracker::new(token_id, user_id, flat_price(), 1.0, 500, 100);
        tracker.record_completion(200);
        tracker.flush().unwrap();
        // target = (100 prompt + 200 completion) - 500 pre = -200 -> clamped to no charge.
        assert_eq!(tracker.charged_so_far(), 0);

        tracker.record_completion(1000);
        tracker.flush().unwrap();
        // target = 1300 - 500 = 800.
        assert_eq!(tracker.charged_so_far(), 800);

        // A repeat flush with no new deltas charges nothing more.
        tracker.flush().unwrap();
        assert_eq!(tracker.charged_so_far(), 800);
    }

    #[test]
    fn tracker_final_usage_overrides_running_estimate() {
        let _guard = testutil::setup();
        let (user_id, token_id) = seed_user_and_token(100_000);

        let tracker = StreamQuotaTracker::new(token_id, user_id, flat_price(), 1.0, 0, 100);
        tracker.record_completion(50);
        tracker.set_final_usage(Usage {
            prompt_tokens: 80,
            completion_tokens: 40,
            ..Usage::default()
        });
        let usage = tracker.final_flush();
        assert_eq!(usage.prompt_tokens, 80);
        assert_eq!(usage.completion_tokens, 40);
        assert_eq!(tracker.charged_so_far(), 120);
    }

    #[test]
    fn mid_stream_exhaustion_lands_user_at_zero() {
        let _guard = testutil::setup();
        // Enough for the 100-token reservation plus 100 completion tokens.
        let (user_id, token_id) = seed_user_and_token(200);

        let tracker = StreamQuotaTracker::new(token_id, user_id, flat_price(), 1.0, 0, 100);
        charge(token_id, user_id, 100).unwrap(); // the pre-consumption

        tracker.record_completion(1000);
        let err = tracker.flush().unwrap_err();
        assert!(matches!(err, RelayError::InsufficientQuota(_)));

        // Not negative, and the tracker stays exhausted.
        assert!(store::users::remaining_quota(user_id).unwrap() >= 0);
        assert!(tracker.flush().is_err());
    }
}
