//! Dialect converter
//!
//! Bidirectional mapping between the three client dialects. The OpenAI chat
//! shape is the neutral internal representation: Claude Messages and the
//! Response API convert into it on the way in, and the response path
//! re-emits whichever dialect the client spoke, streaming included.
//!
//! Streaming conversion is a pull-based transformer: each rewriter consumes
//! one upstream SSE payload and yields zero or more downstream frames, with
//! an explicit finish step for the dialect's end-of-stream marker.

pub mod claude;
pub mod response_api;

use serde_json::Value;

use crate::relay::error::{ConversionCategory, RelayError, RelayResult};

/// Parameters accepted by the OpenAI chat surface. Anything else is
/// dropped before the request leaves the gateway.
pub const CHAT_ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "n",
    "stream",
    "stream_options",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "user",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "response_format",
    "seed",
    "logprobs",
    "top_logprobs",
    "service_tier",
    "store",
    "reasoning_effort",
    "modalities",
    "metadata",
];

/// Keep only the allowed keys of a JSON object payload.
pub fn filter_payload(payload: &Value, allowed: &[&str]) -> Value {
    if let Some(obj) = payload.as_object() {
        let filtered: serde_json::Map<String, Value> = obj
            .iter()
            .filter(|(key, _)| allowed.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(filtered)
    } else {
        payload.clone()
    }
}

/// Strip parameters a specific upstream family refuses. Silent removal is
/// correct when semantics survive (sampling hints); parameters that would
/// change meaning surface as a conversion error instead.
pub fn strip_unsupported_params(payload: &mut Value, unsupported: &[&str]) -> RelayResult<()> {
    let Some(obj) = payload.as_object_mut() else {
        return Ok(());
    };
    for key in unsupported {
        if *key == "response_format" && obj.contains_key(*key) {
            return Err(RelayError::Conversion(
                ConversionCategory::UnsupportedParameter,
                format!("upstream does not support '{}'", key),
            ));
        }
        obj.remove(*key);
    }
    Ok(())
}

/// Extract the model field from any dialect's request body.
pub fn extract_model(payload: &Value) -> RelayResult<String> {
    payload
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("Missing or empty 'model' field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_drops_unknown_keys() {
        let payload = json!({"model": "m", "messages": [], "x_custom": 1});
        let filtered = filter_payload(&payload, CHAT_ALLOWED_FIELDS);
        assert!(filtered.get("model").is_some());
        assert!(filtered.get("x_custom").is_none());
    }

    #[test]
    fn strip_removes_sampling_hints_silently() {
        let mut payload = json!({"model": "m", "top_k": 5, "reasoning_effort": "low"});
        strip_unsupported_params(&mut payload, &["top_k", "reasoning_effort"]).unwrap();
        assert!(payload.get("top_k").is_none());
        assert!(payload.get("reasoning_effort").is_none());
    }

    #[test]
    fn strip_rejects_semantic_parameters() {
        let mut payload = json!({"model": "m", "response_format": {"type": "json_object"}});
        let err = strip_unsupported_params(&mut payload, &["response_format"]).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Conversion(ConversionCategory::UnsupportedParameter, _)
        ));
    }

    #[test]
    fn extract_model_requires_nonempty() {
        assert!(extract_model(&json!({"model": "gpt-4o"})).is_ok());
        assert!(extract_model(&json!({"model": ""})).is_err());
        assert!(extract_model(&json!({})).is_err());
    }
}
