//! Channel scheduler
//!
//! Selects one channel for (model, group), honouring priority buckets,
//! weight-biased draws, per-ability suspension windows and the per-channel
//! rate limit. Failure outcomes reported after the relay write per-class
//! suspension windows back onto the ability row.

use rand::Rng;
use std::time::Duration;

use crate::store::abilities::{self, AbilityCandidate, SuspendClass};
use crate::store::channels::{self, Channel};
use crate::{cache, config, logger, store};

use super::error::{Outcome, RelayError, RelayResult};

/// Attempts against rate-limited channels before giving up.
const RATE_LIMIT_RETRIES: usize = 3;

/// Weighted draw within the highest non-empty priority bucket. `roll` is a
/// uniform sample in `[0, total_weight)`; zero total weight or ties fall to
/// the lowest channel id, which keeps selection reproducible.
pub(crate) fn pick_weighted(bucket: &[AbilityCandidate], roll: i64) -> Option<&AbilityCandidate> {
    if bucket.is_empty() {
        return None;
    }
    let total: i64 = bucket.iter().map(|c| c.weight.max(0)).sum();
    if total <= 0 {
        return bucket.iter().min_by_key(|c| c.channel_id);
    }
    let mut cursor = roll.clamp(0, total - 1);
    for candidate in bucket {
        let weight = candidate.weight.max(0);
        if cursor < weight {
            return Some(candidate);
        }
        cursor -= weight;
    }
    bucket.last()
}

fn top_priority_bucket(candidates: &[AbilityCandidate]) -> &[AbilityCandidate] {
    // Candidates arrive sorted by priority descending, channel id ascending.
    let Some(first) = candidates.first() else {
        return candidates;
    };
    let end = candidates
        .iter()
        .position(|c| c.priority != first.priority)
        .unwrap_or(candidates.len());
    &candidates[..end]
}

/// Select one channel for the request.
///
/// A pinned id takes absolute precedence: it bypasses ability rows and the
/// priority sign, but never a disabled channel.
pub fn select_channel(
    model: &str,
    group: &str,
    pinned_channel: Option<i64>,
) -> RelayResult<Channel> {
    if let Some(channel_id) = pinned_channel {
        let channel = channels::get(channel_id)
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or_else(|| {
                RelayError::InvalidRequest(format!("Pinned channel {} not found", channel_id))
            })?;
        if !channel.is_enabled() {
            return Err(RelayError::RateLimited(format!(
                "Pinned channel {} is disabled",
                channel_id
            )));
        }
        return Ok(channel);
    }

    let window = Duration::from_secs(config::load().rate_limit_window_secs);

    for attempt in 0..=RATE_LIMIT_RETRIES {
        let candidates = abilities::candidates(model, group)
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        if candidates.is_empty() {
            break;
        }

        let bucket = top_priority_bucket(&candidates);
        let total: i64 = bucket.iter().map(|c| c.weight.max(0)).sum();
        let roll = if total > 0 {
            rand::thread_rng().gen_range(0..total)
        } else {
            0
        };
        let Some(candidate) = pick_weighted(bucket, roll) else {
            break;
        };

        let channel = channels::get(candidate.channel_id)
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or_else(|| RelayError::Internal("ability points at a missing channel".to_string()))?;

        let limit = channel.rate_limit.unwrap_or(0);
        if cache::rate_limit_acquire(channel.id, limit, window) {
            logger::debug(
                "scheduler",
                &format!(
                    "Selected channel: id={}, model={}, group={}, attempt={}",
                    channel.id, model, group, attempt
                ),
            );
            return Ok(channel);
        }

        // Bucket exhausted: bench this ability for one window and redraw.
        let until = store::now_unix() + window.as_secs() as i64;
        let _ = abilities::suspend(channel.id, model, group, SuspendClass::RateLimited, until);
        logger::warn(
            "scheduler",
            &format!(
                "Channel {} rate limit exhausted for {}/{}, suspended for {}s",
                channel.id,
                model,
                group,
                window.as_secs()
            ),
        );
    }

    Err(RelayError::RateLimited(format!(
        "no_available_channel for model '{}' in group '{}'",
        model, group
    )))
}

/// Apply the per-class suspension window for a relay outcome. Success and
/// "other" outcomes never suspend.
pub fn report_outcome(channel_id: i64, model: &str, group: &str, outcome: Outcome) {
    let cfg = config::load();
    let (class, window_secs) = match outcome {
        Outcome::RateLimited => (SuspendClass::RateLimited, cfg.suspend_429_secs),
        Outcome::ServerError => (SuspendClass::ServerError, cfg.suspend_5xx_secs),
        Outcome::Auth => (SuspendClass::Auth, cfg.suspend_auth_secs),
        Outcome::Success | Outcome::Other => return,
    };
    let until = store::now_unix() + window_secs;
    if let Err(e) = abilities::suspend(channel_id, model, group, class, until) {
        logger::error(
            "scheduler",
            &format!("Failed to suspend ability: channel={}, error={}", channel_id, e),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::channels::NewChannel;
    use crate::testutil;

    fn candidate(channel_id: i64, priority: i64, weight: i64) -> AbilityCandidate {
        AbilityCandidate {
            channel_id,
            priority,
            weight,
        }
    }

    #[test]
    fn weighted_pick_is_deterministic_given_roll() {
        let bucket = vec![candidate(1, 0, 1), candidate(2, 0, 3)];
        assert_eq!(pick_weighted(&bucket, 0).unwrap().channel_id, 1);
        assert_eq!(pick_weighted(&bucket, 1).unwrap().channel_id, 2);
        assert_eq!(pick_weighted(&bucket, 3).unwrap().channel_id, 2);
    }

    #[test]
    fn zero_weights_fall_to_lowest_id() {
        let bucket = vec![candidate(9, 0, 0), candidate(3, 0, 0), candidate(5, 0, 0)];
        assert_eq!(pick_weighted(&bucket, 0).unwrap().channel_id, 3);
    }

    #[test]
    fn top_bucket_cuts_at_first_priority_drop() {
        let candidates = vec![
            candidate(1, 10, 1),
            candidate(2, 10, 1),
            candidate(3, 0, 1),
        ];
        let bucket = top_priority_bucket(&candidates);
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn pinned_channel_is_returned_when_enabled() {
        let _guard = testutil::setup();
        let id = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "pin-target",
            weight: 1,
            groups: "default",
            models: "pin-model",
            ..Default::default()
        })
        .unwrap();

        let selected = select_channel("pin-model", "default", Some(id)).unwrap();
        assert_eq!(selected.id, id);
    }

    #[test]
    fn pinned_channel_never_bypasses_disabled() {
        let _guard = testutil::setup();
        let id = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "pin-disabled",
            weight: 1,
            groups: "default",
            models: "pin-model-b",
            ..Default::default()
        })
        .unwrap();
        channels::set_status(id, channels::STATUS_MANUALLY_DISABLED).unwrap();

        assert!(select_channel("pin-model-b", "default", Some(id)).is_err());
    }

    #[test]
    fn negative_priority_pauses_channel() {
        let _guard = testutil::setup();
        let id = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "paused",
            priority: -1,
            weight: 1,
            groups: "default",
            models: "paused-model",
            ..Default::default()
        })
        .unwrap();

        let err = select_channel("paused-model", "default", None).unwrap_err();
        assert!(matches!(err, RelayError::RateLimited(_)));
        // But the pin still refuses only on disabled, not on priority.
        assert!(select_channel("paused-model", "default", Some(id)).is_ok());
    }

    #[test]
    fn failure_outcome_writes_suspension_window() {
        let _guard = testutil::setup();
        let id = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "suspend-me",
            weight: 1,
            groups: "default",
            models: "suspend-model",
            ..Default::default()
        })
        .unwrap();

        report_outcome(id, "suspend-model", "default", Outcome::ServerError);
        let until =
            abilities::suspended_until(id, "suspend-model", "default", SuspendClass::ServerError)
                .unwrap();
        let now = store::now_unix();
        assert!(until >= now + config::load().suspend_5xx_secs - 1);

        // Suspended abilities drop out of selection.
        let err = select_channel("suspend-model", "default", None).unwrap_err();
        assert!(matches!(err, RelayError::RateLimited(_)));

        // Success and other never suspend.
        report_outcome(id, "suspend-model", "default", Outcome::Success);
        report_outcome(id, "suspend-model", "default", Outcome::Other);
        let after =
            abilities::suspended_until(id, "suspend-model", "default", SuspendClass::RateLimited)
                .unwrap();
        assert_eq!(after, 0);
    }

    #[test]
    fn higher_priority_bucket_wins() {
        let _guard = testutil::setup();
        let low = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "low-prio",
            priority: 0,
            weight: 100,
            groups: "default",
            models: "prio-model",
            ..Default::default()
        })
        .unwrap();
        let high = channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "high-prio",
            priority: 10,
            weight: 1,
            groups: "default",
            models: "prio-model",
            ..Default::default()
        })
        .unwrap();

        for _ in 0..5 {
            let selected = select_channel("prio-model", "default", None).unwrap();
            assert_eq!(selected.id, high);
        }
        let _ = low;
    }
}
