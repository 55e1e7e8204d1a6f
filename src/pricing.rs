//! Pricing table and quota computation
//!
//! Prices are expressed as USD per 1M tokens; quota units are integer with
//! 500 000 units to the USD. Cached-input and cache-write ratios use the
//! sentinel convention: zero means free, negative means bill at the normal
//! input price, positive is an explicit override.
//!
//! Resolution precedence for a model's price: channel override → adapter
//! default → global default (options table) → final fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QUOTA_PER_USD;

/// Applied when nothing else knows the model.
pub const FALLBACK_RATIO: f64 = 2.5;
pub const FALLBACK_COMPLETION_RATIO: f64 = 3.0;

/// Bill at the normal input price.
pub const SENTINEL_NORMAL_PRICE: f64 = -1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPrice {
    /// Input price, USD per 1M tokens.
    pub ratio: f64,
    /// Output price = input price × this.
    pub completion_ratio: f64,
    /// Sentinel-coded (see module docs).
    pub cached_input_ratio: f64,
    pub cache_write_5m_ratio: f64,
    pub cache_write_1h_ratio: f64,
    /// USD per generated image, for image models.
    pub image_price_usd: Option<f64>,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            ratio: FALLBACK_RATIO,
            completion_ratio: FALLBACK_COMPLETION_RATIO,
            cached_input_ratio: SENTINEL_NORMAL_PRICE,
            cache_write_5m_ratio: 0.0,
            cache_write_1h_ratio: 0.0,
            image_price_usd: None,
        }
    }
}

/// Token counts for one request. Cached prompt tokens are a subset of
/// prompt tokens; cache writes are taken out of the non-cached remainder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_prompt_tokens: i64,
    pub cache_write_5m_tokens: i64,
    pub cache_write_1h_tokens: i64,
    /// Lump-sum quota units for tool invocations.
    pub tools_cost: i64,
}

impl Usage {
    pub fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Output of the compute function: the total and the ratios that were
/// actually applied, for the log row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputedQuota {
    pub total: i64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
}

fn resolve_sentinel(ratio: f64, normal: f64) -> f64 {
    if ratio == 0.0 {
        0.0
    } else if ratio < 0.0 {
        normal
    } else {
        ratio
    }
}

fn quota_per_token(usd_per_million: f64) -> f64 {
    usd_per_million * QUOTA_PER_USD / 1_000_000.0
}

/// The §4.3 formula: tiered token billing in quota units.
///
/// Cache-write tokens in excess of the non-cached prompt are dropped from
/// the 1h bucket first, then the 5m bucket, never below zero.
pub fn compute_quota(usage: &Usage, price: &ModelPrice, group_ratio: f64) -> ComputedQuota {
    let input_price = quota_per_token(price.ratio);
    let output_price = quota_per_token(price.ratio * price.completion_ratio);
    let cached_price = quota_per_token(resolve_sentinel(price.cached_input_ratio, price.ratio));
    let write_5m_price = quota_per_token(resolve_sentinel(price.cache_write_5m_ratio, price.ratio));
    let write_1h_price = quota_per_token(resolve_sentinel(price.cache_write_1h_ratio, price.ratio));

    let cached = usage.cached_prompt_tokens.clamp(0, usage.prompt_tokens);
    let non_cached = usage.prompt_tokens - cached;

    let mut write_5m = usage.cache_write_5m_tokens.max(0);
    let mut write_1h = usage.cache_write_1h_tokens.max(0);
    let mut overflow = (write_5m + write_1h - non_cached).max(0);
    if overflow > 0 {
        let take = overflow.min(write_1h);
        write_1h -= take;
        overflow -= take;
        write_5m -= overflow.min(write_5m);
    }

    let effective_input = (non_cached - write_5m - write_1h).max(0);

    let g = group_ratio;
    let cost = effective_input as f64 * input_price * g
        + cached as f64 * cached_price * g
        + write_5m as f64 * write_5m_price * g
        + write_1h as f64 * write_1h_price * g
        + usage.completion_tokens as f64 * output_price * g;

    let mut total = cost.ceil() as i64 + usage.tools_cost;
    if input_price * g != 0.0 && total <= 0 {
        total = 1;
    }

    ComputedQuota {
        total,
        model_ratio: price.ratio,
        completion_ratio: price.completion_ratio,
    }
}

/// Quota for image generation, billed per image.
pub fn image_quota(image_count: i64, price: &ModelPrice, group_ratio: f64) -> i64 {
    let per_image = price.image_price_usd.unwrap_or(0.0);
    (image_count as f64 * per_image * QUOTA_PER_USD * group_ratio).ceil() as i64
}

/// Rough prompt cost for the pre-consumption reservation.
pub fn approx_prompt_quota(prompt_tokens: i64, price: &ModelPrice, group_ratio: f64) -> i64 {
    (prompt_tokens as f64 * quota_per_token(price.ratio) * group_ratio).ceil() as i64
}

/// Quota units rendered as USD for display surfaces.
pub fn quota_to_usd(quota: i64) -> f64 {
    quota as f64 / QUOTA_PER_USD
}

/// Merge a channel's JSON price override into a base price. Unknown keys
/// are ignored so an override can be partial.
pub fn apply_override(base: ModelPrice, override_value: &Value) -> ModelPrice {
    let mut price = base;
    if let Some(v) = override_value.get("ratio").and_then(|v| v.as_f64()) {
        price.ratio = v;
    }
    if let Some(v) = override_value.get("completion_ratio").and_then(|v| v.as_f64()) {
        price.completion_ratio = v;
    }
    if let Some(v) = override_value
        .get("cached_input_ratio")
        .and_then(|v| v.as_f64())
    {
        price.cached_input_ratio = v;
    }
    if let Some(v) = override_value
        .get("cache_write_5m_ratio")
        .and_then(|v| v.as_f64())
    {
        price.cache_write_5m_ratio = v;
    }
    if let Some(v) = override_value
        .get("cache_write_1h_ratio")
        .and_then(|v| v.as_f64())
    {
        price.cache_write_1h_ratio = v;
    }
    if let Some(v) = override_value.get("image_price_usd").and_then(|v| v.as_f64()) {
        price.image_price_usd = Some(v);
    }
    price
}

/// Global per-model default from the options table.
pub fn global_default(model: &str) -> Option<ModelPrice> {
    let key = format!("model_price:{}", model);
    let raw = crate::store::options::get(&key).ok().flatten()?;
    serde_json::from_str(&raw).ok()
}

/// Full precedence chain for one (channel, model) pair.
pub fn resolve(
    model: &str,
    channel: &crate::store::channels::Channel,
    adapter_default: Option<ModelPrice>,
) -> ModelPrice {
    let base = adapter_default
        .or_else(|| global_default(model))
        .unwrap_or_default();
    let mut price = match channel.price_override_for(model) {
        Some(value) => apply_override(base, &value),
        None => base,
    };
    if let Some(ratio) = channel.completion_ratio_override_for(model) {
        price.completion_ratio = ratio;
    }
    price
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_sonnet_price() -> ModelPrice {
        ModelPrice {
            ratio: 3.0,
            completion_ratio: 5.0,
            cached_input_ratio: 0.3,
            cache_write_5m_ratio: 3.75,
            cache_write_1h_ratio: 6.0,
            image_price_usd: None,
        }
    }

    #[test]
    fn cache_write_and_cached_read_billing() {
        // prompt 1000 (cached 600, write5m 200, write1h 100), completion 200
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 200,
            cached_prompt_tokens: 600,
            cache_write_5m_tokens: 200,
            cache_write_1h_tokens: 100,
            tools_cost: 0,
        };
        let computed = compute_quota(&usage, &claude_sonnet_price(), 1.0);
        // effective input 100 @1.5 + cached 600 @0.15 + 5m 200 @1.875
        // + 1h 100 @3.0 + completion 200 @7.5
        assert_eq!(computed.total, 150 + 90 + 375 + 300 + 1500);
        assert_eq!(computed.model_ratio, 3.0);
        assert_eq!(computed.completion_ratio, 5.0);
    }

    #[test]
    fn zero_prompt_with_completion_only() {
        let usage = Usage {
            prompt_tokens: 0,
            completion_tokens: 100,
            ..Usage::default()
        };
        let price = ModelPrice {
            ratio: 2.0,
            completion_ratio: 4.0,
            ..ModelPrice::default()
        };
        let computed = compute_quota(&usage, &price, 1.0);
        // 100 tokens at 8 USD/M = 0.0008 USD = 400 units
        assert_eq!(computed.total, 400);
    }

    #[test]
    fn all_prompt_written_to_cache() {
        let usage = Usage {
            prompt_tokens: 300,
            completion_tokens: 0,
            cached_prompt_tokens: 0,
            cache_write_5m_tokens: 200,
            cache_write_1h_tokens: 100,
            tools_cost: 0,
        };
        let price = claude_sonnet_price();
        let computed = compute_quota(&usage, &price, 1.0);
        // effectiveInput = 0; only write buckets bill.
        assert_eq!(computed.total, 375 + 300);
    }

    #[test]
    fn write_overflow_subtracts_1h_first() {
        // nonCached = 100, writes total 150: 1h loses the 50 overflow.
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 0,
            cached_prompt_tokens: 0,
            cache_write_5m_tokens: 75,
            cache_write_1h_tokens: 75,
            tools_cost: 0,
        };
        let price = claude_sonnet_price();
        let computed = compute_quota(&usage, &price, 1.0);
        // write5m 75 @1.875 + write1h 25 @3.0, effective input 0
        let expected = (75.0 * 1.875 + 25.0 * 3.0_f64).ceil() as i64;
        assert_eq!(computed.total, expected);
    }

    #[test]
    fn minimum_one_unit_when_priced() {
        let usage = Usage {
            prompt_tokens: 1,
            ..Usage::default()
        };
        let price = ModelPrice {
            ratio: 0.01,
            completion_ratio: 1.0,
            ..ModelPrice::default()
        };
        let computed = compute_quota(&usage, &price, 1.0);
        assert_eq!(computed.total, 1);
    }

    #[test]
    fn free_model_stays_zero() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
            ..Usage::default()
        };
        let price = ModelPrice {
            ratio: 0.0,
            completion_ratio: 1.0,
            cached_input_ratio: 0.0,
            cache_write_5m_ratio: 0.0,
            cache_write_1h_ratio: 0.0,
            image_price_usd: None,
        };
        let computed = compute_quota(&usage, &price, 1.0);
        assert_eq!(computed.total, 0);
    }

    #[test]
    fn cached_tokens_never_cost_more_than_uncached() {
        let price = claude_sonnet_price();
        let base = Usage {
            prompt_tokens: 1000,
            completion_tokens: 100,
            ..Usage::default()
        };
        let uncached = compute_quota(&base, &price, 1.0).total;
        for cached in [1, 250, 500, 1000] {
            let usage = Usage {
                cached_prompt_tokens: cached,
                ..base
            };
            let discounted = compute_quota(&usage, &price, 1.0).total;
            assert!(discounted < uncached, "cached={} not cheaper", cached);
        }
    }

    #[test]
    fn negative_sentinel_bills_at_input_price() {
        let price = ModelPrice {
            ratio: 2.0,
            completion_ratio: 1.0,
            cached_input_ratio: SENTINEL_NORMAL_PRICE,
            ..ModelPrice::default()
        };
        let all_cached = Usage {
            prompt_tokens: 1000,
            cached_prompt_tokens: 1000,
            ..Usage::default()
        };
        let none_cached = Usage {
            prompt_tokens: 1000,
            ..Usage::default()
        };
        assert_eq!(
            compute_quota(&all_cached, &price, 1.0).total,
            compute_quota(&none_cached, &price, 1.0).total
        );
    }

    #[test]
    fn group_ratio_scales_cost() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 0,
            ..Usage::default()
        };
        let price = ModelPrice {
            ratio: 2.0,
            completion_ratio: 1.0,
            ..ModelPrice::default()
        };
        let normal = compute_quota(&usage, &price, 1.0).total;
        let doubled = compute_quota(&usage, &price, 2.0).total;
        assert_eq!(doubled, normal * 2);
    }

    #[test]
    fn tools_cost_is_additive() {
        let usage = Usage {
            prompt_tokens: 1000,
            tools_cost: 77,
            ..Usage::default()
        };
        let price = ModelPrice {
            ratio: 2.0,
            completion_ratio: 1.0,
            ..ModelPrice::default()
        };
        let with_tools = compute_quota(&usage, &price, 1.0).total;
        let without = compute_quota(
            &Usage {
                tools_cost: 0,
                ..usage
            },
            &price,
            1.0,
        )
        .total;
        assert_eq!(with_tools, without + 77);
    }

    #[test]
    fn partial_override_merges() {
        let base = claude_sonnet_price();
        let merged = apply_override(base, &serde_json::json!({"completion_ratio": 2.0}));
        assert_eq!(merged.ratio, 3.0);
        assert_eq!(merged.completion_ratio, 2.0);
        assert_eq!(merged.cached_input_ratio, 0.3);
    }

    #[test]
    fn image_quota_rounds_up() {
        let price = ModelPrice {
            image_price_usd: Some(0.04),
            ..ModelPrice::default()
        };
        assert_eq!(image_quota(2, &price, 1.0), 40_000);
        assert_eq!(image_quota(0, &price, 1.0), 0);
    }
}
