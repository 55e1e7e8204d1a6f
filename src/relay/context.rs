//! Relay context
//!
//! The typed carrier threaded through the pipeline: identity, dialect,
//! model names, selected channel and conversion flags. Adapters receive it
//! by reference and declare their needs in their signatures instead of
//! pulling values out of a stringly-keyed bag.

use serde_json::Value;
use std::time::Instant;

use crate::pricing::Usage;
use crate::store::{channels::Channel, tokens::Token, users::User};

/// Client-facing request/response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Chat,
    Claude,
    Response,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Chat => "chat",
            Dialect::Claude => "claude",
            Dialect::Response => "response",
        }
    }
}

/// Modality of the relayed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Chat,
    Embeddings,
    ImageGeneration,
    ImageEdit,
    AudioSpeech,
    AudioTranscription,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Chat => "chat",
            RelayMode::Embeddings => "embeddings",
            RelayMode::ImageGeneration => "image_generation",
            RelayMode::ImageEdit => "image_edit",
            RelayMode::AudioSpeech => "audio_speech",
            RelayMode::AudioTranscription => "audio_transcription",
        }
    }
}

/// Per-request state built at ingress and enriched along the pipeline.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub trace_id: String,
    pub dialect: Dialect,
    pub mode: RelayMode,
    pub token: Token,
    pub user: User,
    pub group: String,
    pub group_ratio: f64,
    /// The model exactly as the client sent it; logged unmodified.
    pub original_model: String,
    pub is_streaming: bool,
    /// Admin-pinned channel id, parsed from the key suffix.
    pub pinned_channel: Option<i64>,
    /// Set by the scheduler.
    pub channel: Option<Channel>,
    /// Provider-specific model name after the channel rewrite map.
    pub upstream_model: String,
    /// The incoming body was Claude Messages and was converted to chat;
    /// the response path must back-convert.
    pub claude_conversion: bool,
    /// Tool name a structured-output promotion replaced, when it fired.
    pub claude_promoted_tool: Option<String>,
    /// Original Response API body, kept for the response-path rewrite.
    pub response_api_request: Option<Value>,
    pub started_at: Instant,
}

impl RelayContext {
    pub fn channel_id(&self) -> i64 {
        self.channel.as_ref().map(|c| c.id).unwrap_or(0)
    }

    pub fn latency_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }
}

/// Rough token estimate (~3.5 chars per token) for when an upstream omits
/// usage counts.
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

/// Usage block from an OpenAI-shaped response, including the cached-token
/// detail when present.
pub fn parse_openai_usage(usage: &Value) -> Usage {
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Usage {
        prompt_tokens: usage
            .get("prompt_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        cached_prompt_tokens: cached,
        cache_write_5m_tokens: 0,
        cache_write_1h_tokens: 0,
        tools_cost: 0,
    }
}

/// Usage block from an Anthropic response. Cache-creation buckets map to
/// the write tiers: ephemeral 5m and 1h directly, the legacy field into the
/// 5m bucket. Anthropic's `input_tokens` excludes cache reads and writes,
/// so the prompt total is reassembled here.
pub fn parse_claude_usage(usage: &Value) -> Usage {
    let as_i64 = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    let cached = as_i64("cache_read_input_tokens");

    let detail = usage.get("cache_creation");
    let mut write_5m = detail
        .and_then(|d| d.get("ephemeral_5m_input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let write_1h = detail
        .and_then(|d| d.get("ephemeral_1h_input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if write_5m == 0 && write_1h == 0 {
        // Legacy single-bucket field predates the tiered detail.
        write_5m = as_i64("cache_creation_input_tokens");
    }

    Usage {
        prompt_tokens: as_i64("input_tokens") + cached + write_5m + write_1h,
        completion_tokens: as_i64("output_tokens"),
        cached_prompt_tokens: cached,
        cache_write_5m_tokens: write_5m,
        cache_write_1h_tokens: write_1h,
        tools_cost: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimate_rounds_to_nearest() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello w"), 2);
    }

    #[test]
    fn openai_usage_reads_cached_detail() {
        let usage = parse_openai_usage(&json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "prompt_tokens_details": {"cached_tokens": 40}
        }));
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 20);
        assert_eq!(usage.cached_prompt_tokens, 40);
    }

    #[test]
    fn claude_usage_maps_cache_buckets() {
        let usage = parse_claude_usage(&json!({
            "input_tokens": 100,
            "output_tokens": 50,
            "cache_read_input_tokens": 600,
            "cache_creation": {
                "ephemeral_5m_input_tokens": 200,
                "ephemeral_1h_input_tokens": 100
            }
        }));
        assert_eq!(usage.prompt_tokens, 1000);
        assert_eq!(usage.cached_prompt_tokens, 600);
        assert_eq!(usage.cache_write_5m_tokens, 200);
        assert_eq!(usage.cache_write_1h_tokens, 100);
    }

    #[test]
    fn claude_legacy_cache_creation_goes_to_5m() {
        let usage = parse_claude_usage(&json!({
            "input_tokens": 80,
            "output_tokens": 10,
            "cache_creation_input_tokens": 20
        }));
        assert_eq!(usage.cache_write_5m_tokens, 20);
        assert_eq!(usage.cache_write_1h_tokens, 0);
        assert_eq!(usage.prompt_tokens, 100);
    }
}
