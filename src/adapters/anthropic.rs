//! Anthropic adapter
//!
//! Speaks the Messages wire natively. Claude-dialect clients pass through
//! with field filtering and the model rewrite; chat and Response API
//! clients are converted through the dialect layer.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::dialect::{self, claude, response_api};
use crate::pricing::{ModelPrice, Usage};
use crate::relay::client::normalize_stream_flag;
use crate::relay::context::{parse_claude_usage, Dialect, RelayContext};
use crate::relay::error::{RelayError, RelayResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Fields the Messages API accepts.
const CLAUDE_ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "stream",
    "system",
    "temperature",
    "top_p",
    "top_k",
    "stop_sequences",
    "metadata",
    "tools",
    "tool_choice",
    "thinking",
    "betas",
];

const fn claude_price(
    ratio: f64,
    cached: f64,
    write_5m: f64,
    write_1h: f64,
) -> ModelPrice {
    ModelPrice {
        ratio,
        completion_ratio: 5.0,
        cached_input_ratio: cached,
        cache_write_5m_ratio: write_5m,
        cache_write_1h_ratio: write_1h,
        image_price_usd: None,
    }
}

static MODELS: &[(&str, ModelPrice)] = &[
    ("claude-sonnet-4-0", claude_price(3.0, 0.3, 3.75, 6.0)),
    ("claude-sonnet-4-5", claude_price(3.0, 0.3, 3.75, 6.0)),
    ("claude-opus-4-1", claude_price(15.0, 1.5, 18.75, 30.0)),
    ("claude-haiku-3-5", claude_price(0.8, 0.08, 1.0, 1.6)),
];

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    pub fn model_list(&self) -> Vec<String> {
        MODELS.iter().map(|(model, _)| model.to_string()).collect()
    }

    pub fn default_pricing(&self, model: &str) -> Option<ModelPrice> {
        MODELS
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, price)| *price)
    }

    pub fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        let channel = ctx
            .channel
            .as_ref()
            .ok_or_else(|| RelayError::Internal("no channel selected".to_string()))?;
        let base = if channel.base_url.trim().is_empty() {
            "https://api.anthropic.com"
        } else {
            channel.base_url.trim()
        };
        Ok(format!("{}/v1/messages", base.trim_end_matches('/')))
    }

    pub fn setup_headers(&self, ctx: &RelayContext, headers: &mut HeaderMap) {
        if let Some(channel) = ctx.channel.as_ref() {
            if let Ok(value) = HeaderValue::from_str(&channel.key) {
                headers.insert("x-api-key", value);
            }
        }
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
    }

    fn finalize(&self, ctx: &RelayContext, mut body: Value) -> Value {
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(ctx.upstream_model.clone()),
            );
        }
        normalize_stream_flag(&mut body);
        body
    }

    /// Chat-dialect request onto the Messages wire.
    pub fn convert_request(&self, ctx: &RelayContext, payload: &Value) -> RelayResult<Value> {
        let converted = claude::from_openai_request(payload, &ctx.upstream_model);
        Ok(self.finalize(ctx, converted))
    }

    /// Claude-dialect request: filter and rewrite only.
    pub fn convert_claude_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<(Value, Option<String>)> {
        let filtered = dialect::filter_payload(payload, CLAUDE_ALLOWED_FIELDS);
        Ok((self.finalize(ctx, filtered), None))
    }

    /// Response-API request: lower to chat first, then onto the wire.
    pub fn convert_response_api_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<Value> {
        let chat = response_api::to_openai_request(payload, &ctx.upstream_model)?;
        self.convert_request(ctx, &chat)
    }

    pub fn parse_buffered_response(
        &self,
        ctx: &RelayContext,
        body: &Value,
    ) -> RelayResult<(Value, Usage)> {
        if body.get("type").and_then(|v| v.as_str()) == Some("error") {
            return Err(RelayError::UpstreamError(
                body.get("error").cloned().unwrap_or_default().to_string(),
            ));
        }
        let usage = parse_claude_usage(body.get("usage").unwrap_or(&Value::Null));

        let client_body = match ctx.dialect {
            Dialect::Claude => body.clone(),
            Dialect::Chat => claude::to_openai_response(body, &ctx.original_model),
            Dialect::Response => {
                let chat = claude::to_openai_response(body, &ctx.original_model);
                response_api::from_openai_response(&chat, ctx.response_api_request.as_ref())
            }
        };
        Ok((client_body, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_table_covers_sonnet() {
        let price = AnthropicAdapter.default_pricing("claude-sonnet-4-0").unwrap();
        assert_eq!(price.ratio, 3.0);
        assert_eq!(price.completion_ratio, 5.0);
        assert_eq!(price.cached_input_ratio, 0.3);
        assert_eq!(price.cache_write_5m_ratio, 3.75);
        assert_eq!(price.cache_write_1h_ratio, 6.0);
    }
}
