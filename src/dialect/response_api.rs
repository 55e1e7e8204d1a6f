//! Response API dialect
//!
//! Converts `/v1/responses` bodies into the neutral chat shape for channels
//! whose adapter only speaks chat, and wraps chat responses back into the
//! Response API envelope, streaming included. The original request body is
//! carried in the relay context so the rewrite can echo its metadata.

use serde_json::{json, Map, Value};

use crate::relay::context::estimate_tokens;
use crate::relay::error::{RelayError, RelayResult};

// ============================================================================
// Request path: Response API -> OpenAI chat
// ============================================================================

fn input_item_to_chat_message(item: &Value) -> Option<Value> {
    // Bare strings and typed message items both appear in `input`.
    if let Some(text) = item.as_str() {
        return Some(json!({ "role": "user", "content": text }));
    }

    let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("message");
    match item_type {
        "message" => {
            let role = item.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let content = match item.get("content") {
                Some(Value::String(text)) => Value::String(text.clone()),
                Some(Value::Array(parts)) => {
                    let mut chat_parts = Vec::new();
                    for part in parts {
                        match part.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                            "input_text" | "output_text" | "text" => {
                                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                    chat_parts.push(json!({ "type": "text", "text": text }));
                                }
                            }
                            "input_image" => {
                                if let Some(url) =
                                    part.get("image_url").and_then(|v| v.as_str())
                                {
                                    chat_parts.push(json!({
                                        "type": "image_url",
                                        "image_url": { "url": url }
                                    }));
                                }
                            }
                            _ => {}
                        }
                    }
                    if chat_parts.len() == 1
                        && chat_parts[0].get("type").and_then(|v| v.as_str()) == Some("text")
                    {
                        chat_parts[0]
                            .get("text")
                            .cloned()
                            .unwrap_or(Value::String(String::new()))
                    } else {
                        Value::Array(chat_parts)
                    }
                }
                _ => Value::String(String::new()),
            };
            Some(json!({ "role": role, "content": content }))
        }
        "function_call" => {
            let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
            let call_id = item
                .get("call_id")
                .and_then(|v| v.as_str())
                .unwrap_or("call_0");
            let arguments = item
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            Some(json!({
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "id": call_id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments }
                }]
            }))
        }
        "function_call_output" => {
            let call_id = item
                .get("call_id")
                .and_then(|v| v.as_str())
                .unwrap_or("call_0");
            let output = item.get("output").and_then(|v| v.as_str()).unwrap_or("");
            Some(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": output
            }))
        }
        _ => None,
    }
}

fn map_response_tools_to_chat(tools: &Value) -> Option<Value> {
    let tools_array = tools.as_array()?;
    let mut mapped = Vec::new();
    for tool in tools_array {
        let tool_type = tool.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if !tool_type.eq_ignore_ascii_case("function") {
            continue;
        }
        // Response API tools are flat; chat nests them under `function`.
        let name = tool.get("name").and_then(|v| v.as_str())?;
        let mut function = Map::new();
        function.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(desc) = tool.get("description") {
            function.insert("description".to_string(), desc.clone());
        }
        if let Some(params) = tool.get("parameters") {
            function.insert("parameters".to_string(), params.clone());
        }
        if let Some(strict) = tool.get("strict") {
            function.insert("strict".to_string(), strict.clone());
        }
        mapped.push(json!({ "type": "function", "function": Value::Object(function) }));
    }
    if mapped.is_empty() {
        None
    } else {
        Some(Value::Array(mapped))
    }
}

/// Convert a Response API request into the neutral chat shape.
///
/// Text-only input collapses to a single string message; structured input,
/// tool definitions, reasoning config and JSON-schema descriptors all carry
/// over.
pub fn to_openai_request(payload: &Value, model: &str) -> RelayResult<Value> {
    let mut chat_request = Map::new();
    chat_request.insert("model".to_string(), Value::String(model.to_string()));

    let mut messages = Vec::new();

    if let Some(instructions) = payload.get("instructions").and_then(|v| v.as_str()) {
        if !instructions.is_empty() {
            messages.push(json!({ "role": "system", "content": instructions }));
        }
    }

    match payload.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({ "role": "user", "content": text }));
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(message) = input_item_to_chat_message(item) {
                    messages.push(message);
                }
            }
        }
        _ => {
            return Err(RelayError::InvalidRequest(
                "Missing 'input' field".to_string(),
            ))
        }
    }

    chat_request.insert("messages".to_string(), Value::Array(messages));

    if let Some(max_tokens) = payload.get("max_output_tokens") {
        chat_request.insert("max_tokens".to_string(), max_tokens.clone());
    }
    if let Some(temperature) = payload.get("temperature") {
        chat_request.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = payload.get("top_p") {
        chat_request.insert("top_p".to_string(), top_p.clone());
    }
    if let Some(stream) = payload.get("stream") {
        chat_request.insert("stream".to_string(), stream.clone());
    }
    if let Some(effort) = payload
        .get("reasoning")
        .and_then(|r| r.get("effort"))
    {
        chat_request.insert("reasoning_effort".to_string(), effort.clone());
    }
    if let Some(metadata) = payload.get("metadata") {
        chat_request.insert("metadata".to_string(), metadata.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = map_response_tools_to_chat(tools) {
            chat_request.insert("tools".to_string(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        chat_request.insert("tool_choice".to_string(), normalize_tool_choice(choice));
    }

    // text.format json_schema descriptors round-trip into response_format.
    if let Some(format) = payload.get("text").and_then(|t| t.get("format")) {
        let format_type = format.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match format_type {
            "json_schema" => {
                chat_request.insert(
                    "response_format".to_string(),
                    json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": format.get("name").cloned().unwrap_or(json!("response")),
                            "strict": format.get("strict").cloned().unwrap_or(json!(true)),
                            "schema": format.get("schema").cloned().unwrap_or(json!({}))
                        }
                    }),
                );
            }
            "json_object" => {
                chat_request.insert(
                    "response_format".to_string(),
                    json!({ "type": "json_object" }),
                );
            }
            _ => {}
        }
    }

    Ok(Value::Object(chat_request))
}

fn normalize_tool_choice(choice: &Value) -> Value {
    match choice {
        Value::Object(obj)
            if obj.get("type").and_then(|v| v.as_str()) == Some("function")
                && obj.get("name").is_some() =>
        {
            // Response API uses flat {type, name}; chat nests the name.
            json!({
                "type": "function",
                "function": { "name": obj.get("name").cloned().unwrap_or_default() }
            })
        }
        other => other.clone(),
    }
}

// ============================================================================
// Response path: OpenAI chat -> Response API envelope
// ============================================================================

fn chat_usage_to_response(usage: Option<&Value>) -> Value {
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let cached = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    json!({
        "input_tokens": prompt,
        "input_tokens_details": { "cached_tokens": cached },
        "output_tokens": completion,
        "total_tokens": prompt + completion
    })
}

fn response_id_from(chat_id: Option<&str>) -> String {
    match chat_id {
        Some(id) if id.starts_with("resp_") => id.to_string(),
        Some(id) => format!("resp_{}", id.trim_start_matches("chatcmpl-")),
        None => "resp_unknown".to_string(),
    }
}

/// Wrap a buffered chat response into the Response API envelope. The
/// original request body supplies echoed metadata.
pub fn from_openai_response(response: &Value, original_request: Option<&Value>) -> Value {
    let id = response_id_from(response.get("id").and_then(|v| v.as_str()));
    let created = response
        .get("created")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let mut output = Vec::new();
    let mut status = "completed";

    if let Some(choice) = response
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
    {
        if choice.get("finish_reason").and_then(|v| v.as_str()) == Some("length") {
            status = "incomplete";
        }
        if let Some(message) = choice.get("message") {
            let text = match message.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                    .collect::<Vec<_>>()
                    .join(""),
                _ => String::new(),
            };
            if !text.is_empty() {
                output.push(json!({
                    "type": "message",
                    "id": format!("msg_{}", id.trim_start_matches("resp_")),
                    "status": "completed",
                    "role": "assistant",
                    "content": [{
                        "type": "output_text",
                        "text": text,
                        "annotations": []
                    }]
                }));
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
                for (i, tool_call) in tool_calls.iter().enumerate() {
                    let function = tool_call.get("function");
                    output.push(json!({
                        "type": "function_call",
                        "id": format!("fc_{}_{}", id.trim_start_matches("resp_"), i),
                        "call_id": tool_call.get("id").cloned().unwrap_or(json!("call_0")),
                        "name": function
                            .and_then(|f| f.get("name"))
                            .cloned()
                            .unwrap_or(json!("tool")),
                        "arguments": function
                            .and_then(|f| f.get("arguments"))
                            .cloned()
                            .unwrap_or(json!("{}")),
                        "status": "completed"
                    }));
                }
            }
        }
    }

    let model = response
        .get("model")
        .cloned()
        .or_else(|| original_request.and_then(|r| r.get("model").cloned()))
        .unwrap_or(json!("unknown"));

    json!({
        "id": id,
        "object": "response",
        "created_at": created,
        "status": status,
        "model": model,
        "output": output,
        "metadata": original_request
            .and_then(|r| r.get("metadata").cloned())
            .unwrap_or(json!({})),
        "usage": chat_usage_to_response(response.get("usage"))
    })
}

// ============================================================================
// Streaming path: OpenAI chat chunks -> Response API events
// ============================================================================

/// Stateful rewriter from chat chunks to Response API SSE events, ending
/// with `response.completed` and the `[DONE]` sentinel.
pub struct ResponseStreamRewriter {
    started: bool,
    completed_sent: bool,
    response_id: String,
    model: String,
    accumulated_text: String,
    pub completion_tokens: i64,
    pub final_usage: Option<Value>,
}

fn data_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

impl ResponseStreamRewriter {
    pub fn new(model: &str) -> Self {
        Self {
            started: false,
            completed_sent: false,
            response_id: String::new(),
            model: model.to_string(),
            accumulated_text: String::new(),
            completion_tokens: 0,
            final_usage: None,
        }
    }

    /// Rewrite one upstream payload into zero or more Response API frames.
    pub fn rewrite(&mut self, data: &str) -> Vec<String> {
        if crate::relay::client::is_sse_done(data) {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        let mut frames = Vec::new();

        if !self.started {
            self.started = true;
            self.response_id = response_id_from(chunk.get("id").and_then(|v| v.as_str()));
            frames.push(data_frame(
                "response.created",
                &json!({
                    "type": "response.created",
                    "response": {
                        "id": self.response_id,
                        "object": "response",
                        "status": "in_progress",
                        "model": self.model
                    }
                }),
            ));
        }

        if let Some(usage) = chunk.get("usage") {
            if usage.get("prompt_tokens").is_some() {
                self.final_usage = Some(usage.clone());
            }
        }

        if let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|v| v.first())
        {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
            {
                if !content.is_empty() {
                    self.accumulated_text.push_str(content);
                    self.completion_tokens += estimate_tokens(content);
                    frames.push(data_frame(
                        "response.output_text.delta",
                        &json!({
                            "type": "response.output_text.delta",
                            "item_id": format!("msg_{}", self.response_id.trim_start_matches("resp_")),
                            "output_index": 0,
                            "content_index": 0,
                            "delta": content
                        }),
                    ));
                }
            }
            if let Some(finish) = choice.get("finish_reason") {
                if !finish.is_null() {
                    frames.extend(self.finish());
                }
            }
        }

        frames
    }

    /// Emit `response.completed` with the assembled body, then `[DONE]`.
    pub fn finish(&mut self) -> Vec<String> {
        if self.completed_sent {
            return Vec::new();
        }
        self.completed_sent = true;

        let usage = self.final_usage.take().unwrap_or_else(|| {
            json!({ "prompt_tokens": 0, "completion_tokens": self.completion_tokens })
        });
        let response = json!({
            "id": self.response_id,
            "object": "response",
            "status": "completed",
            "model": self.model,
            "output": [{
                "type": "message",
                "id": format!("msg_{}", self.response_id.trim_start_matches("resp_")),
                "status": "completed",
                "role": "assistant",
                "content": [{
                    "type": "output_text",
                    "text": self.accumulated_text,
                    "annotations": []
                }]
            }],
            "usage": chat_usage_to_response(Some(&usage))
        });

        vec![
            data_frame(
                "response.completed",
                &json!({ "type": "response.completed", "response": response }),
            ),
            "data: [DONE]\n\n".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_only_input_collapses_to_string_message() {
        let payload = json!({
            "model": "gpt-4o",
            "input": "hello"
        });
        let chat = to_openai_request(&payload, "gpt-4o").unwrap();
        assert_eq!(chat["messages"][0]["role"], "user");
        assert_eq!(chat["messages"][0]["content"], "hello");
    }

    #[test]
    fn structured_input_and_tools_carry_over() {
        let payload = json!({
            "model": "gpt-4o",
            "instructions": "Be helpful.",
            "input": [
                {"type": "message", "role": "user", "content": [
                    {"type": "input_text", "text": "describe this"},
                    {"type": "input_image", "image_url": "https://example.com/cat.png"}
                ]}
            ],
            "tools": [{
                "type": "function",
                "name": "lookup",
                "description": "Lookup a record",
                "parameters": {"type": "object"}
            }],
            "reasoning": {"effort": "low"},
            "max_output_tokens": 128
        });
        let chat = to_openai_request(&payload, "gpt-4o").unwrap();
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(chat["tools"][0]["function"]["name"], "lookup");
        assert_eq!(chat["reasoning_effort"], "low");
        assert_eq!(chat["max_tokens"], 128);
    }

    #[test]
    fn json_schema_descriptor_round_trips() {
        let payload = json!({
            "model": "gpt-4o",
            "input": "give me json",
            "text": {"format": {
                "type": "json_schema",
                "name": "record",
                "strict": true,
                "schema": {"type": "object", "additionalProperties": false}
            }}
        });
        let chat = to_openai_request(&payload, "gpt-4o").unwrap();
        assert_eq!(chat["response_format"]["type"], "json_schema");
        assert_eq!(chat["response_format"]["json_schema"]["name"], "record");
    }

    #[test]
    fn tool_call_history_converts() {
        let payload = json!({
            "model": "gpt-4o",
            "input": [
                {"type": "message", "role": "user", "content": "add 2+2"},
                {"type": "function_call", "call_id": "c1", "name": "add",
                 "arguments": "{\"a\":2,\"b\":2}"},
                {"type": "function_call_output", "call_id": "c1", "output": "4"}
            ]
        });
        let chat = to_openai_request(&payload, "gpt-4o").unwrap();
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["content"], "4");
    }

    #[test]
    fn envelope_wraps_chat_response() {
        let chat_response = json!({
            "id": "chatcmpl-42",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "pong"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1}
        });
        let original = json!({"model": "gpt-4o", "metadata": {"k": "v"}});
        let envelope = from_openai_response(&chat_response, Some(&original));
        assert_eq!(envelope["object"], "response");
        assert_eq!(envelope["id"], "resp_42");
        assert_eq!(envelope["status"], "completed");
        assert_eq!(envelope["output"][0]["content"][0]["text"], "pong");
        assert_eq!(envelope["metadata"]["k"], "v");
        assert_eq!(envelope["usage"]["input_tokens"], 3);
        assert_eq!(envelope["usage"]["total_tokens"], 4);
    }

    #[test]
    fn length_finish_marks_incomplete() {
        let chat_response = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {"role": "assistant", "content": "partial"},
                "finish_reason": "length"
            }]
        });
        let envelope = from_openai_response(&chat_response, None);
        assert_eq!(envelope["status"], "incomplete");
    }

    #[test]
    fn stream_rewriter_ends_with_completed_and_done() {
        let mut rewriter = ResponseStreamRewriter::new("gpt-4o");
        let first = rewriter.rewrite(
            r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{"content":"po"}}]}"#,
        );
        assert!(first[0].contains("response.created"));
        assert!(first[1].contains("response.output_text.delta"));

        let _ = rewriter.rewrite(
            r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{"content":"ng"}}]}"#,
        );
        let last = rewriter.rewrite(
            r#"{"id":"chatcmpl-9","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
        );
        let joined = last.join("");
        assert!(joined.contains("response.completed"));
        assert!(joined.contains("\"text\":\"pong\""));
        assert!(joined.ends_with("data: [DONE]\n\n"));

        // The [DONE] sentinel after finish adds nothing more.
        assert!(rewriter.rewrite("[DONE]").is_empty());
    }

    #[test]
    fn usage_only_stream_still_terminates() {
        let mut rewriter = ResponseStreamRewriter::new("gpt-4o");
        let frames = rewriter.rewrite(
            r#"{"id":"chatcmpl-x","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":0}}"#,
        );
        assert!(frames[0].contains("response.created"));
        let done = rewriter.rewrite("[DONE]");
        let joined = done.join("");
        assert!(joined.contains("response.completed"));
        assert!(joined.ends_with("data: [DONE]\n\n"));
    }
}
