//! Adapter registry
//!
//! One adapter per upstream provider family, keyed by the channel's numeric
//! type. The OpenAI-compatible core serves every family that exposes a
//! chat-completions surface (most of them do); the Anthropic adapter speaks
//! the Messages wire natively. Families needing signed vendor transports
//! (Bedrock, Vertex) ride the compatible core against their
//! OpenAI-compatible endpoints; credential glue is out of scope here.

pub mod anthropic;
pub mod openai;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::pricing::ModelPrice;
use crate::relay::context::{Dialect, RelayContext, RelayMode};
use crate::relay::error::{RelayError, RelayResult};

use self::anthropic::AnthropicAdapter;
use self::openai::{CompatibleFamily, OpenAIAdapter};

// Channel type numbers are stable identifiers stored on channel rows.
pub const TYPE_OPENAI: i64 = 1;
pub const TYPE_AZURE: i64 = 3;
pub const TYPE_ANTHROPIC: i64 = 14;
pub const TYPE_ZHIPU: i64 = 16;
pub const TYPE_OPENROUTER: i64 = 20;
pub const TYPE_GEMINI: i64 = 24;
pub const TYPE_MOONSHOT: i64 = 25;
pub const TYPE_MISTRAL: i64 = 26;
pub const TYPE_GROQ: i64 = 29;
pub const TYPE_BEDROCK: i64 = 33;
pub const TYPE_DEEPSEEK: i64 = 36;
pub const TYPE_TOGETHER: i64 = 39;
pub const TYPE_VERTEX: i64 = 42;
pub const TYPE_XAI: i64 = 45;

/// Adapter dispatch. Enum rather than trait objects so the async response
/// paths stay plain functions.
pub enum Adapter {
    OpenAI(OpenAIAdapter),
    Anthropic(AnthropicAdapter),
}

/// Table-driven construction from channel type to implementation. Unknown
/// types fall back to the plain OpenAI family, the least surprising wire.
pub fn for_channel_type(channel_type: i64) -> Adapter {
    match channel_type {
        TYPE_ANTHROPIC => Adapter::Anthropic(AnthropicAdapter),
        other => Adapter::OpenAI(OpenAIAdapter::new(family_for(other))),
    }
}

fn family_for(channel_type: i64) -> &'static CompatibleFamily {
    match channel_type {
        TYPE_AZURE => &openai::AZURE,
        TYPE_ZHIPU => &openai::ZHIPU,
        TYPE_OPENROUTER => &openai::OPENROUTER,
        TYPE_GEMINI => &openai::GEMINI,
        TYPE_MOONSHOT => &openai::MOONSHOT,
        TYPE_MISTRAL => &openai::MISTRAL,
        TYPE_GROQ => &openai::GROQ,
        TYPE_BEDROCK => &openai::BEDROCK,
        TYPE_DEEPSEEK => &openai::DEEPSEEK,
        TYPE_TOGETHER => &openai::TOGETHER,
        TYPE_VERTEX => &openai::VERTEX,
        TYPE_XAI => &openai::XAI,
        _ => &openai::OPENAI,
    }
}

impl Adapter {
    pub fn channel_name(&self) -> &'static str {
        match self {
            Adapter::OpenAI(a) => a.channel_name(),
            Adapter::Anthropic(a) => a.channel_name(),
        }
    }

    /// The dialect this upstream family speaks on the wire.
    pub fn native_dialect(&self) -> Dialect {
        match self {
            Adapter::OpenAI(_) => Dialect::Chat,
            Adapter::Anthropic(_) => Dialect::Claude,
        }
    }

    pub fn model_list(&self) -> Vec<String> {
        match self {
            Adapter::OpenAI(a) => a.model_list(),
            Adapter::Anthropic(a) => a.model_list(),
        }
    }

    pub fn default_pricing(&self, model: &str) -> Option<ModelPrice> {
        match self {
            Adapter::OpenAI(a) => a.default_pricing(model),
            Adapter::Anthropic(a) => a.default_pricing(model),
        }
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        self.default_pricing(model)
            .map(|p| p.ratio)
            .unwrap_or(crate::pricing::FALLBACK_RATIO)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.default_pricing(model)
            .map(|p| p.completion_ratio)
            .unwrap_or(crate::pricing::FALLBACK_COMPLETION_RATIO)
    }

    pub fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        match self {
            Adapter::OpenAI(a) => a.request_url(ctx),
            Adapter::Anthropic(a) => a.request_url(ctx),
        }
    }

    pub fn setup_headers(&self, ctx: &RelayContext, headers: &mut HeaderMap) {
        match self {
            Adapter::OpenAI(a) => a.setup_headers(ctx, headers),
            Adapter::Anthropic(a) => a.setup_headers(ctx, headers),
        }
    }

    /// Convert a neutral chat request into the upstream body. Never touches
    /// `ctx.original_model`; the rewritten name is applied to the body only.
    pub fn convert_request(&self, ctx: &RelayContext, payload: &Value) -> RelayResult<Value> {
        match self {
            Adapter::OpenAI(a) => a.convert_request(ctx, payload),
            Adapter::Anthropic(a) => a.convert_request(ctx, payload),
        }
    }

    /// Convert a Claude Messages request into the upstream body. The second
    /// return is the promoted structured-output tool, when promotion fired.
    pub fn convert_claude_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<(Value, Option<String>)> {
        match self {
            Adapter::OpenAI(a) => a.convert_claude_request(ctx, payload),
            Adapter::Anthropic(a) => a.convert_claude_request(ctx, payload),
        }
    }

    /// Convert a Response API request into the upstream body.
    pub fn convert_response_api_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<Value> {
        match self {
            Adapter::OpenAI(a) => a.convert_response_api_request(ctx, payload),
            Adapter::Anthropic(a) => a.convert_response_api_request(ctx, payload),
        }
    }

    pub fn convert_image_request(&self, ctx: &RelayContext, payload: &Value) -> RelayResult<Value> {
        match self {
            Adapter::OpenAI(a) => a.convert_image_request(ctx, payload),
            Adapter::Anthropic(_) => Err(RelayError::Conversion(
                crate::relay::error::ConversionCategory::UnsupportedParameter,
                "image generation is not available on this channel".to_string(),
            )),
        }
    }

    pub fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<Value> {
        match self {
            Adapter::OpenAI(a) => a.convert_embedding_request(ctx, payload),
            Adapter::Anthropic(_) => Err(RelayError::Conversion(
                crate::relay::error::ConversionCategory::UnsupportedParameter,
                "embeddings are not available on this channel".to_string(),
            )),
        }
    }

    /// Dispatch the prepared body upstream.
    pub async fn do_request(
        &self,
        ctx: &RelayContext,
        client: &reqwest::Client,
        body: &Value,
    ) -> RelayResult<crate::relay::client::RequestAttempt> {
        let url = self.request_url(ctx)?;
        let mut headers = HeaderMap::new();
        self.setup_headers(ctx, &mut headers);
        crate::relay::client::post_json(client, &url, headers, body).await
    }

    /// Buffered response handling: parse the upstream body, lift it into
    /// the neutral chat shape where needed, and extract the usage snapshot.
    /// Streaming responses are pumped by the relay controller, which picks
    /// its rewriters off `native_dialect()`.
    pub fn parse_buffered_response(
        &self,
        ctx: &RelayContext,
        body: &Value,
    ) -> RelayResult<(Value, crate::pricing::Usage)> {
        match self {
            Adapter::OpenAI(a) => a.parse_buffered_response(ctx, body),
            Adapter::Anthropic(a) => a.parse_buffered_response(ctx, body),
        }
    }
}

/// Full default catalogue across families, for `/v1/models`.
pub fn all_default_models() -> Vec<(String, &'static str)> {
    let mut out = Vec::new();
    for family in openai::ALL_FAMILIES {
        for (model, _) in family.models {
            out.push((model.to_string(), family.name));
        }
    }
    for model in AnthropicAdapter.model_list() {
        out.push((model, "anthropic"));
    }
    out
}

/// Per-mode URL suffix shared by the OpenAI-compatible families.
pub(crate) fn chat_mode_path(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::Chat => "/chat/completions",
        RelayMode::Embeddings => "/embeddings",
        RelayMode::ImageGeneration => "/images/generations",
        RelayMode::ImageEdit => "/images/edits",
        RelayMode::AudioSpeech => "/audio/speech",
        RelayMode::AudioTranscription => "/audio/transcriptions",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_maps_channel_types() {
        assert!(matches!(
            for_channel_type(TYPE_ANTHROPIC),
            Adapter::Anthropic(_)
        ));
        assert!(matches!(for_channel_type(TYPE_OPENAI), Adapter::OpenAI(_)));
        assert!(matches!(for_channel_type(9999), Adapter::OpenAI(_)));
        assert_eq!(for_channel_type(TYPE_GROQ).channel_name(), "groq");
        assert_eq!(for_channel_type(TYPE_DEEPSEEK).channel_name(), "deepseek");
    }

    #[test]
    fn native_dialects() {
        assert_eq!(
            for_channel_type(TYPE_ANTHROPIC).native_dialect(),
            Dialect::Claude
        );
        assert_eq!(for_channel_type(TYPE_OPENAI).native_dialect(), Dialect::Chat);
    }

    #[test]
    fn default_catalogue_is_nonempty() {
        let models = all_default_models();
        assert!(models.iter().any(|(m, _)| m == "gpt-4o-mini"));
        assert!(models.iter().any(|(m, _)| m == "claude-sonnet-4-0"));
    }
}
