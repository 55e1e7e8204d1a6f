//! OpenAI-compatible adapter core
//!
//! Shared implementation for every family that speaks the chat-completions
//! wire. A family contributes its base URL, auth header style, default
//! model pricing table and the parameters its service refuses.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::dialect::{self, claude, response_api, CHAT_ALLOWED_FIELDS};
use crate::pricing::{ModelPrice, Usage};
use crate::relay::client::normalize_stream_flag;
use crate::relay::context::{parse_openai_usage, Dialect, RelayContext};
use crate::relay::error::{RelayError, RelayResult};

/// How the family expects credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
}

pub struct CompatibleFamily {
    pub name: &'static str,
    pub default_base: &'static str,
    /// Path prefix between the base URL and the per-mode suffix.
    pub api_prefix: &'static str,
    pub auth_style: AuthStyle,
    /// Parameters this service refuses; stripped or rejected per semantics.
    pub unsupported_params: &'static [&'static str],
    pub models: &'static [(&'static str, ModelPrice)],
}

const fn price(ratio: f64, completion_ratio: f64) -> ModelPrice {
    ModelPrice {
        ratio,
        completion_ratio,
        cached_input_ratio: -1.0,
        cache_write_5m_ratio: 0.0,
        cache_write_1h_ratio: 0.0,
        image_price_usd: None,
    }
}

const fn price_cached(ratio: f64, completion_ratio: f64, cached: f64) -> ModelPrice {
    ModelPrice {
        ratio,
        completion_ratio,
        cached_input_ratio: cached,
        cache_write_5m_ratio: 0.0,
        cache_write_1h_ratio: 0.0,
        image_price_usd: None,
    }
}

const fn price_image(usd_per_image: f64) -> ModelPrice {
    ModelPrice {
        ratio: 0.0,
        completion_ratio: 1.0,
        cached_input_ratio: 0.0,
        cache_write_5m_ratio: 0.0,
        cache_write_1h_ratio: 0.0,
        image_price_usd: Some(usd_per_image),
    }
}

pub static OPENAI: CompatibleFamily = CompatibleFamily {
    name: "openai",
    default_base: "https://api.openai.com",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("gpt-4o", price_cached(2.5, 4.0, 1.25)),
        ("gpt-4o-mini", price_cached(0.15, 4.0, 0.075)),
        ("gpt-4.1", price_cached(2.0, 4.0, 0.5)),
        ("gpt-4.1-mini", price_cached(0.4, 4.0, 0.1)),
        ("o3", price_cached(2.0, 4.0, 0.5)),
        ("text-embedding-3-small", price(0.02, 1.0)),
        ("text-embedding-3-large", price(0.13, 1.0)),
        ("whisper-1", price(6.0, 1.0)),
        ("tts-1", price(15.0, 1.0)),
        ("dall-e-3", price_image(0.04)),
        ("gpt-image-1", price_image(0.04)),
    ],
};

pub static AZURE: CompatibleFamily = CompatibleFamily {
    name: "azure",
    default_base: "",
    api_prefix: "/openai/v1",
    auth_style: AuthStyle::ApiKeyHeader,
    unsupported_params: &[],
    models: &[
        ("gpt-4o", price_cached(2.5, 4.0, 1.25)),
        ("gpt-4o-mini", price_cached(0.15, 4.0, 0.075)),
        ("gpt-4.1", price_cached(2.0, 4.0, 0.5)),
    ],
};

pub static DEEPSEEK: CompatibleFamily = CompatibleFamily {
    name: "deepseek",
    default_base: "https://api.deepseek.com",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("deepseek-chat", price_cached(0.27, 4.1, 0.07)),
        ("deepseek-reasoner", price_cached(0.55, 4.0, 0.14)),
    ],
};

pub static GROQ: CompatibleFamily = CompatibleFamily {
    name: "groq",
    default_base: "https://api.groq.com/openai",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    // Groq refuses these outright; they are sampling hints, so dropping
    // them preserves semantics.
    unsupported_params: &["reasoning_effort", "top_k", "logit_bias"],
    models: &[
        ("llama-3.3-70b-versatile", price(0.59, 1.34)),
        ("llama-3.1-8b-instant", price(0.05, 1.6)),
        ("qwen-2.5-32b", price(0.29, 1.38)),
    ],
};

pub static MISTRAL: CompatibleFamily = CompatibleFamily {
    name: "mistral",
    default_base: "https://api.mistral.ai",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &["reasoning_effort"],
    models: &[
        ("mistral-large-latest", price(2.0, 3.0)),
        ("mistral-small-latest", price(0.2, 3.0)),
        ("codestral-latest", price(0.3, 3.0)),
    ],
};

pub static MOONSHOT: CompatibleFamily = CompatibleFamily {
    name: "moonshot",
    default_base: "https://api.moonshot.cn",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("kimi-k2-0711-preview", price_cached(0.6, 4.0, 0.15)),
        ("moonshot-v1-128k", price(0.84, 1.0)),
    ],
};

pub static ZHIPU: CompatibleFamily = CompatibleFamily {
    name: "zhipu",
    default_base: "https://open.bigmodel.cn/api/paas",
    api_prefix: "/v4",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("glm-4.5", price(0.6, 3.7)),
        ("glm-4.5-air", price(0.2, 5.5)),
    ],
};

pub static GEMINI: CompatibleFamily = CompatibleFamily {
    name: "gemini",
    default_base: "https://generativelanguage.googleapis.com/v1beta/openai",
    api_prefix: "",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &["logit_bias", "service_tier"],
    models: &[
        ("gemini-2.5-pro", price_cached(1.25, 8.0, 0.31)),
        ("gemini-2.5-flash", price_cached(0.3, 8.3, 0.075)),
        ("gemini-2.5-flash-lite", price_cached(0.1, 4.0, 0.025)),
    ],
};

pub static OPENROUTER: CompatibleFamily = CompatibleFamily {
    name: "openrouter",
    default_base: "https://openrouter.ai/api",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[],
};

pub static TOGETHER: CompatibleFamily = CompatibleFamily {
    name: "together",
    default_base: "https://api.together.xyz",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[(
        "meta-llama/Llama-3.3-70B-Instruct-Turbo",
        price(0.88, 1.0),
    )],
};

pub static XAI: CompatibleFamily = CompatibleFamily {
    name: "xai",
    default_base: "https://api.x.ai",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("grok-4", price_cached(3.0, 5.0, 0.75)),
        ("grok-3-mini", price_cached(0.3, 1.67, 0.075)),
    ],
};

/// Bedrock and Vertex ride the compatible core against operator-provided
/// OpenAI-compatible gateways; signed SDK transports are out of scope.
pub static BEDROCK: CompatibleFamily = CompatibleFamily {
    name: "bedrock",
    default_base: "",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[(
        "anthropic.claude-sonnet-4-20250514-v1:0",
        ModelPrice {
            ratio: 3.0,
            completion_ratio: 5.0,
            cached_input_ratio: 0.3,
            cache_write_5m_ratio: 3.75,
            cache_write_1h_ratio: 6.0,
            image_price_usd: None,
        },
    )],
};

pub static VERTEX: CompatibleFamily = CompatibleFamily {
    name: "vertex",
    default_base: "",
    api_prefix: "/v1",
    auth_style: AuthStyle::Bearer,
    unsupported_params: &[],
    models: &[
        ("gemini-2.5-pro", price_cached(1.25, 8.0, 0.31)),
        ("gemini-2.5-flash", price_cached(0.3, 8.3, 0.075)),
    ],
};

pub static ALL_FAMILIES: &[&CompatibleFamily] = &[
    &OPENAI, &AZURE, &DEEPSEEK, &GROQ, &MISTRAL, &MOONSHOT, &ZHIPU, &GEMINI, &OPENROUTER,
    &TOGETHER, &XAI, &BEDROCK, &VERTEX,
];

const EMBEDDING_ALLOWED_FIELDS: &[&str] =
    &["model", "input", "encoding_format", "dimensions", "user"];

const IMAGE_ALLOWED_FIELDS: &[&str] = &[
    "model",
    "prompt",
    "n",
    "quality",
    "response_format",
    "size",
    "style",
    "background",
    "output_format",
    "user",
];

pub struct OpenAIAdapter {
    family: &'static CompatibleFamily,
}

impl OpenAIAdapter {
    pub fn new(family: &'static CompatibleFamily) -> Self {
        Self { family }
    }

    pub fn channel_name(&self) -> &'static str {
        self.family.name
    }

    pub fn model_list(&self) -> Vec<String> {
        self.family
            .models
            .iter()
            .map(|(model, _)| model.to_string())
            .collect()
    }

    pub fn default_pricing(&self, model: &str) -> Option<ModelPrice> {
        self.family
            .models
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, price)| *price)
    }

    pub fn unsupported_params(&self) -> &'static [&'static str] {
        self.family.unsupported_params
    }

    pub fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        let channel = ctx
            .channel
            .as_ref()
            .ok_or_else(|| RelayError::Internal("no channel selected".to_string()))?;
        let base = if channel.base_url.trim().is_empty() {
            self.family.default_base
        } else {
            channel.base_url.trim()
        };
        if base.is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "channel '{}' has no base URL configured",
                channel.name
            )));
        }
        Ok(format!(
            "{}{}{}",
            base.trim_end_matches('/'),
            self.family.api_prefix,
            super::chat_mode_path(ctx.mode)
        ))
    }

    pub fn setup_headers(&self, ctx: &RelayContext, headers: &mut HeaderMap) {
        let key = ctx
            .channel
            .as_ref()
            .map(|c| c.key.as_str())
            .unwrap_or_default();
        match self.family.auth_style {
            AuthStyle::Bearer => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key)) {
                    headers.insert("authorization", value);
                }
            }
            AuthStyle::ApiKeyHeader => {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("api-key", value);
                }
            }
        }
        headers.insert("content-type", HeaderValue::from_static("application/json"));
    }

    fn finalize(&self, ctx: &RelayContext, mut body: Value) -> RelayResult<Value> {
        dialect::strip_unsupported_params(&mut body, self.family.unsupported_params)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(ctx.upstream_model.clone()),
            );
        }
        normalize_stream_flag(&mut body);
        Ok(body)
    }

    pub fn convert_request(&self, ctx: &RelayContext, payload: &Value) -> RelayResult<Value> {
        let filtered = dialect::filter_payload(payload, CHAT_ALLOWED_FIELDS);
        self.finalize(ctx, filtered)
    }

    pub fn convert_claude_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<(Value, Option<String>)> {
        let allow_promotion = ctx
            .channel
            .as_ref()
            .map(|c| !c.disable_structured_output)
            .unwrap_or(true);
        let (converted, promoted) =
            claude::to_openai_request(payload, &ctx.upstream_model, allow_promotion)?;
        Ok((self.finalize(ctx, converted)?, promoted))
    }

    pub fn convert_response_api_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<Value> {
        let converted = response_api::to_openai_request(payload, &ctx.upstream_model)?;
        self.finalize(ctx, converted)
    }

    pub fn convert_embedding_request(
        &self,
        ctx: &RelayContext,
        payload: &Value,
    ) -> RelayResult<Value> {
        let filtered = dialect::filter_payload(payload, EMBEDDING_ALLOWED_FIELDS);
        self.finalize(ctx, filtered)
    }

    pub fn convert_image_request(&self, ctx: &RelayContext, payload: &Value) -> RelayResult<Value> {
        if payload.get("prompt").and_then(|v| v.as_str()).is_none() {
            return Err(RelayError::InvalidRequest(
                "Missing 'prompt' field".to_string(),
            ));
        }
        let filtered = dialect::filter_payload(payload, IMAGE_ALLOWED_FIELDS);
        self.finalize(ctx, filtered)
    }

    pub fn parse_buffered_response(
        &self,
        ctx: &RelayContext,
        body: &Value,
    ) -> RelayResult<(Value, Usage)> {
        if let Some(error) = body.get("error") {
            return Err(RelayError::UpstreamError(error.to_string()));
        }
        let usage = parse_openai_usage(body.get("usage").unwrap_or(&Value::Null));

        let client_body = match ctx.dialect {
            Dialect::Chat => body.clone(),
            Dialect::Claude => claude::from_openai_response(
                body,
                &ctx.original_model,
                ctx.claude_promoted_tool.as_deref(),
            ),
            Dialect::Response => {
                response_api::from_openai_response(body, ctx.response_api_request.as_ref())
            }
        };
        Ok((client_body, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_pricing_lookup() {
        let adapter = OpenAIAdapter::new(&OPENAI);
        let price = adapter.default_pricing("gpt-4o-mini").unwrap();
        assert_eq!(price.ratio, 0.15);
        assert!(adapter.default_pricing("no-such-model").is_none());
    }

    #[test]
    fn groq_refuses_reasoning_effort_and_top_k() {
        let adapter = OpenAIAdapter::new(&GROQ);
        assert!(adapter.unsupported_params().contains(&"reasoning_effort"));
        assert!(adapter.unsupported_params().contains(&"top_k"));
        assert!(OpenAIAdapter::new(&OPENAI).unsupported_params().is_empty());
    }
}
