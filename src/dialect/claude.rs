//! Claude Messages dialect
//!
//! Request conversion into the neutral chat shape, response back-conversion
//! into Claude Messages, and the streaming rewriter that turns OpenAI chat
//! chunks into the Claude SSE event sequence.

use serde_json::{json, Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::relay::context::estimate_tokens;
use crate::relay::error::{RelayError, RelayResult};

// ============================================================================
// Request path: Claude Messages -> OpenAI chat
// ============================================================================

fn text_from_claude_block(block: &Value) -> Option<String> {
    match block.get("type").and_then(|v| v.as_str()) {
        Some("text") => block
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        Some("thinking") => block
            .get("thinking")
            .and_then(|v| v.as_str())
            .map(|s| format!("[Thinking] {}", s)),
        _ => None,
    }
}

fn push_claude_image_as_chat_part(parts: &mut Vec<Value>, block: &Value) {
    let source = block.get("source");
    let source_type = source
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if source_type.eq_ignore_ascii_case("base64") {
        let media_type = source
            .and_then(|v| v.get("media_type"))
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream");
        let data = source
            .and_then(|v| v.get("data"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !data.is_empty() {
            let url = format!("data:{};base64,{}", media_type, data);
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": url }
            }));
            return;
        }
    }
    if let Some(url) = source
        .and_then(|v| v.get("url"))
        .and_then(|v| v.as_str())
    {
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": url }
        }));
        return;
    }
    parts.push(json!({ "type": "text", "text": "[Image]" }));
}

fn chat_content_from_parts(parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        if let Some(obj) = parts[0].as_object() {
            if obj.get("type").and_then(|v| v.as_str()) == Some("text") {
                if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                    return Value::String(text.to_string());
                }
            }
        }
    }
    Value::Array(parts)
}

fn map_claude_tools_to_chat(tools: &Value) -> Option<Value> {
    let tools_array = tools.as_array()?;
    let mut mapped = Vec::new();

    for tool in tools_array {
        let name = tool.get("name").and_then(|v| v.as_str())?;
        let mut function = Map::new();
        function.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(desc) = tool.get("description") {
            function.insert("description".to_string(), desc.clone());
        }
        if let Some(schema) = tool.get("input_schema") {
            function.insert("parameters".to_string(), schema.clone());
        }

        let mut entry = Map::new();
        entry.insert("type".to_string(), Value::String("function".to_string()));
        entry.insert("function".to_string(), Value::Object(function));
        mapped.push(Value::Object(entry));
    }

    if mapped.is_empty() {
        None
    } else {
        Some(Value::Array(mapped))
    }
}

fn map_claude_tool_choice_to_chat(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(raw) => match raw.to_ascii_lowercase().as_str() {
            "auto" | "any" => Some(Value::String("auto".to_string())),
            "none" => Some(Value::String("none".to_string())),
            _ => None,
        },
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(|v| v.as_str())?;
            match kind.to_ascii_lowercase().as_str() {
                "auto" | "any" => Some(Value::String("auto".to_string())),
                "none" => Some(Value::String("none".to_string())),
                "tool" => {
                    let name = obj.get("name").and_then(|v| v.as_str())?;
                    Some(json!({
                        "type": "function",
                        "function": { "name": name }
                    }))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Convert a Claude Messages request into the neutral chat shape.
///
/// Returns the chat body plus the name of the tool a structured-output
/// promotion replaced, when the promotion fired. `output_json` and
/// `output_json_delta` fragments concatenate into one JSON text part so a
/// chat-shaped upstream serialises them as plain text.
pub fn to_openai_request(
    payload: &Value,
    model: &str,
    allow_promotion: bool,
) -> RelayResult<(Value, Option<String>)> {
    let mut chat_request = Map::new();
    chat_request.insert("model".to_string(), Value::String(model.to_string()));

    let mut chat_messages = Vec::new();
    let mut has_tool_history = false;

    let messages = payload
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RelayError::InvalidRequest("Missing 'messages' array".to_string()))?;

    for msg in messages {
        let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");

        let mut content_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_messages = Vec::new();
        let mut json_fragments = String::new();

        match msg.get("content") {
            Some(Value::String(text)) => {
                if !text.is_empty() {
                    content_parts.push(json!({ "type": "text", "text": text }));
                }
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text" | "thinking" => {
                            if let Some(text) = text_from_claude_block(block) {
                                content_parts.push(json!({ "type": "text", "text": text }));
                            }
                        }
                        "output_json" | "output_json_delta" => {
                            // Fragments concatenate; flushed as one text part
                            // after the block loop.
                            if let Some(raw) = block
                                .get("json")
                                .or_else(|| block.get("partial_json"))
                            {
                                match raw {
                                    Value::String(s) => json_fragments.push_str(s),
                                    other => json_fragments.push_str(&other.to_string()),
                                }
                            }
                        }
                        "image" => {
                            push_claude_image_as_chat_part(&mut content_parts, block);
                        }
                        "tool_use" => {
                            has_tool_history = true;
                            let name =
                                block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                            let id = block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("tool_call");
                            let input = block.get("input").cloned().unwrap_or(Value::Null);
                            let args = serde_json::to_string(&input)
                                .unwrap_or_else(|_| "{}".to_string());
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": args }
                            }));
                        }
                        "tool_result" => {
                            has_tool_history = true;
                            let tool_id = block
                                .get("tool_use_id")
                                .or_else(|| block.get("id"))
                                .and_then(|v| v.as_str())
                                .unwrap_or("tool_call");
                            tool_messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_id,
                                "content": tool_result_text(block)
                            }));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        if !json_fragments.is_empty() {
            content_parts.push(json!({ "type": "text", "text": json_fragments }));
        }

        if content_parts.is_empty() && tool_calls.is_empty() && !tool_messages.is_empty() {
            // A pure tool-result turn collapses to the tool messages alone.
            chat_messages.extend(tool_messages);
            continue;
        }

        let mut chat_msg = Map::new();
        chat_msg.insert("role".to_string(), Value::String(role.to_string()));
        if content_parts.is_empty() {
            chat_msg.insert("content".to_string(), Value::String(String::new()));
        } else {
            chat_msg.insert(
                "content".to_string(),
                chat_content_from_parts(content_parts),
            );
        }
        if !tool_calls.is_empty() {
            chat_msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        chat_messages.push(Value::Object(chat_msg));
        chat_messages.extend(tool_messages);
    }

    if let Some(system) = payload.get("system") {
        let system_text = match system {
            Value::String(text) => Some(text.clone()),
            Value::Array(blocks) => {
                let texts: Vec<String> = blocks
                    .iter()
                    .filter_map(text_from_claude_block)
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n\n"))
                }
            }
            _ => None,
        };
        if let Some(text) = system_text {
            chat_messages.insert(
                0,
                json!({ "role": "system", "content": text }),
            );
        }
    }

    chat_request.insert("messages".to_string(), Value::Array(chat_messages));

    if let Some(max_tokens) = payload.get("max_tokens") {
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
    if let Some(stop_sequences) = payload.get("stop_sequences") {
        chat_request.insert("stop".to_string(), stop_sequences.clone());
    }
    if let Some(metadata) = payload.get("metadata") {
        chat_request.insert("metadata".to_string(), metadata.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = map_claude_tools_to_chat(tools) {
            chat_request.insert("tools".to_string(), mapped);
        }
    }
    if let Some(tool_choice) = payload.get("tool_choice") {
        if let Some(mapped) = map_claude_tool_choice_to_chat(tool_choice) {
            chat_request.insert("tool_choice".to_string(), mapped);
        }
    }

    let mut promoted_tool = None;
    if allow_promotion && !has_tool_history {
        promoted_tool = try_promote_structured_output(&mut chat_request, payload);
    }

    Ok((Value::Object(chat_request), promoted_tool))
}

// ============================================================================
// Structured-output promotion
// ============================================================================

fn schema_rejects_additional_properties(schema: &Value) -> bool {
    schema
        .get("additionalProperties")
        .and_then(|v| v.as_bool())
        .map(|b| !b)
        .unwrap_or(false)
}

fn mentions_structured_keyword(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("json") || lower.contains("schema") || lower.contains("structured")
}

fn conversation_mentions_structured(payload: &Value) -> bool {
    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in messages {
            match msg.get("content") {
                Some(Value::String(text)) if mentions_structured_keyword(text) => return true,
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            if mentions_structured_keyword(text) {
                                return true;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if let Some(system) = payload.get("system").and_then(|v| v.as_str()) {
        if mentions_structured_keyword(system) {
            return true;
        }
    }
    false
}

/// Replace a single forced tool with `response_format: json_schema` when
/// the request is really a structured-output request in tool clothing.
///
/// All conditions must hold: exactly one tool whose schema forbids
/// additional properties, no tool history, a `tool_choice` that forces that
/// tool (case-insensitive), and "json"/"schema"/"structured" mentioned in
/// the tool description or conversation text.
fn try_promote_structured_output(chat_request: &mut Map<String, Value>, payload: &Value) -> Option<String> {
    let tools = payload.get("tools").and_then(|v| v.as_array())?;
    if tools.len() != 1 {
        return None;
    }
    let tool = &tools[0];
    let name = tool.get("name").and_then(|v| v.as_str())?;
    let schema = tool.get("input_schema")?;
    if !schema_rejects_additional_properties(schema) {
        return None;
    }

    let choice = payload.get("tool_choice")?;
    let chosen = choice
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|t| t.eq_ignore_ascii_case("tool"))
        .and_then(|_| choice.get("name"))
        .and_then(|v| v.as_str())?;
    if !chosen.eq_ignore_ascii_case(name) {
        return None;
    }

    let description_mentions = tool
        .get("description")
        .and_then(|v| v.as_str())
        .map(mentions_structured_keyword)
        .unwrap_or(false);
    if !description_mentions && !conversation_mentions_structured(payload) {
        return None;
    }

    chat_request.remove("tools");
    chat_request.remove("tool_choice");
    chat_request.insert(
        "response_format".to_string(),
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": name,
                "strict": true,
                "schema": schema
            }
        }),
    );
    Some(name.to_string())
}

// ============================================================================
// Request path: OpenAI chat -> Claude Messages
// ============================================================================

fn chat_content_to_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<String> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|v| v.as_str()).map(String::from))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        Value::Object(obj) => obj
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn append_chat_content_blocks(blocks: &mut Vec<Value>, content: &Value) {
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
        }
        Value::Array(parts) => {
            for part in parts {
                let part_type = part.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match part_type {
                    "text" => {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    "image_url" => {
                        let url = part
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if let Some(rest) = url.strip_prefix("data:") {
                            // data:<media>;base64,<data> maps onto a base64
                            // source block.
                            if let Some((media, data)) = rest.split_once(";base64,") {
                                blocks.push(json!({
                                    "type": "image",
                                    "source": {
                                        "type": "base64",
                                        "media_type": media,
                                        "data": data
                                    }
                                }));
                                continue;
                            }
                        }
                        blocks.push(json!({
                            "type": "image",
                            "source": { "type": "url", "url": url }
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn chat_tool_call_to_claude_block(tool_call: &Value) -> Option<Value> {
    let function = tool_call.get("function")?;
    let name = function.get("name")?.as_str()?;
    let args_raw = function
        .get("arguments")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input =
        serde_json::from_str(args_raw).unwrap_or_else(|_| Value::String(args_raw.to_string()));
    let id = tool_call
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("tool_call");

    Some(json!({
        "type": "tool_use",
        "id": id,
        "name": name,
        "input": input
    }))
}

fn map_chat_tools_to_claude(tools: &Value) -> Option<Value> {
    let tools_array = tools.as_array()?;
    let mut mapped = Vec::new();

    for tool in tools_array {
        let tool_type = tool.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if !tool_type.eq_ignore_ascii_case("function") {
            continue;
        }
        let function = tool.get("function")?;
        let name = function.get("name")?.as_str()?;

        let mut entry = Map::new();
        entry.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(desc) = function.get("description") {
            entry.insert("description".to_string(), desc.clone());
        }
        if let Some(params) = function.get("parameters") {
            entry.insert("input_schema".to_string(), params.clone());
        }
        mapped.push(Value::Object(entry));
    }

    if mapped.is_empty() {
        None
    } else {
        Some(Value::Array(mapped))
    }
}

fn map_chat_tool_choice_to_claude(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(raw) => match raw.to_ascii_lowercase().as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "none" => Some(json!({ "type": "none" })),
            "required" => Some(json!({ "type": "any" })),
            _ => None,
        },
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(|v| v.as_str())?;
            if kind.eq_ignore_ascii_case("function") {
                let name = obj
                    .get("function")
                    .and_then(|v| v.get("name"))
                    .and_then(|v| v.as_str())?;
                Some(json!({ "type": "tool", "name": name }))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Convert a neutral chat request into Claude Messages, for channels whose
/// adapter speaks the Claude wire natively.
pub fn from_openai_request(payload: &Value, model: &str) -> Value {
    let mut claude_request = Map::new();
    claude_request.insert("model".to_string(), Value::String(model.to_string()));

    let mut system_parts = Vec::new();
    let mut messages_out: Vec<Value> = Vec::new();

    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");

            if role.eq_ignore_ascii_case("system") {
                if let Some(text) = msg.get("content").and_then(chat_content_to_text) {
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                continue;
            }

            if role.eq_ignore_ascii_case("tool") {
                // Tool results ride in a user turn as tool_result blocks.
                let tool_id = msg
                    .get("tool_call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool_call");
                let content = msg
                    .get("content")
                    .and_then(chat_content_to_text)
                    .unwrap_or_default();
                messages_out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_id,
                        "content": content
                    }]
                }));
                continue;
            }

            let mut blocks = Vec::new();
            if let Some(content) = msg.get("content") {
                append_chat_content_blocks(&mut blocks, content);
            }
            if let Some(tool_calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                for tool_call in tool_calls {
                    if let Some(block) = chat_tool_call_to_claude_block(tool_call) {
                        blocks.push(block);
                    }
                }
            }

            if blocks.is_empty() {
                blocks.push(json!({ "type": "text", "text": "" }));
            }

            messages_out.push(json!({ "role": role, "content": blocks }));
        }
    }

    claude_request.insert("messages".to_string(), Value::Array(messages_out));

    if !system_parts.is_empty() {
        claude_request.insert("system".to_string(), Value::String(system_parts.join("\n\n")));
    }

    if let Some(max_tokens) = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
    {
        claude_request.insert("max_tokens".to_string(), max_tokens.clone());
    } else {
        // The Messages API requires max_tokens.
        claude_request.insert("max_tokens".to_string(), json!(4096));
    }
    if let Some(temperature) = payload.get("temperature") {
        claude_request.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = payload.get("top_p") {
        claude_request.insert("top_p".to_string(), top_p.clone());
    }
    if let Some(stream) = payload.get("stream") {
        claude_request.insert("stream".to_string(), stream.clone());
    }
    if let Some(stop) = payload.get("stop") {
        let mapped = match stop {
            Value::String(text) => Value::Array(vec![Value::String(text.clone())]),
            _ => stop.clone(),
        };
        claude_request.insert("stop_sequences".to_string(), mapped);
    }
    if let Some(metadata) = payload.get("metadata") {
        claude_request.insert("metadata".to_string(), metadata.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = map_chat_tools_to_claude(tools) {
            claude_request.insert("tools".to_string(), mapped);
        }
    }
    if let Some(tool_choice) = payload.get("tool_choice") {
        if let Some(mapped) = map_chat_tool_choice_to_claude(tool_choice) {
            claude_request.insert("tool_choice".to_string(), mapped);
        }
    }

    Value::Object(claude_request)
}

// ============================================================================
// Response path: OpenAI chat -> Claude Messages
// ============================================================================

pub fn map_chat_finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("stop") => "end_turn".to_string(),
        Some("length") => "max_tokens".to_string(),
        Some("tool_calls") | Some("function_call") => "tool_use".to_string(),
        Some(other) => other.to_string(),
        None => "end_turn".to_string(),
    }
}

pub fn map_claude_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

fn chat_message_to_claude_blocks(message: &Value) -> Vec<Value> {
    let mut blocks = Vec::new();

    if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            blocks.push(json!({ "type": "thinking", "thinking": reasoning }));
        }
    }

    match message.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                if part.get("type").and_then(|v| v.as_str()) == Some("text") {
                    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for tool_call in tool_calls {
            if let Some(block) = chat_tool_call_to_claude_block(tool_call) {
                blocks.push(block);
            }
        }
    }

    blocks
}

fn chat_usage_to_claude(response: &Value) -> Value {
    let usage = response.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    json!({ "input_tokens": prompt, "output_tokens": completion })
}

/// Convert a buffered chat response into a Claude message. When a
/// structured-output promotion replaced the request's tool, the JSON text
/// folds back into a single `tool_use` block under that tool's name.
pub fn from_openai_response(response: &Value, model: &str, promoted_tool: Option<&str>) -> Value {
    let id_raw = response
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("msg_unknown");
    let id = if id_raw.starts_with("msg_") {
        id_raw.to_string()
    } else {
        format!("msg_{}", id_raw)
    };

    let choice = response
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first());

    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str());

    let mut content_blocks = Vec::new();
    let mut stop_reason = map_chat_finish_reason(finish_reason);

    if let Some(choice) = choice {
        if let Some(message) = choice.get("message") {
            if let Some(tool) = promoted_tool {
                let text = message
                    .get("content")
                    .and_then(chat_content_to_text)
                    .unwrap_or_default();
                let input = serde_json::from_str::<Value>(&text)
                    .unwrap_or_else(|_| Value::String(text.clone()));
                content_blocks.push(json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", conversation_fingerprint(response)),
                    "name": tool,
                    "input": input
                }));
                stop_reason = "tool_use".to_string();
            } else {
                content_blocks = chat_message_to_claude_blocks(message);
            }
        }
    }

    if content_blocks.is_empty() {
        content_blocks.push(json!({ "type": "text", "text": "" }));
    }

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": response.get("model").cloned().unwrap_or_else(|| Value::String(model.to_string())),
        "content": content_blocks,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": chat_usage_to_claude(response)
    })
}

/// Opaque fingerprint over message bytes, used for synthesized block ids
/// and the thinking-signature cache key. Bytes in, bytes out: no
/// normalisation of whitespace or ordering.
pub fn conversation_fingerprint(payload: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in messages {
            if let Some(role) = msg.get("role").and_then(|v| v.as_str()) {
                role.hash(&mut hasher);
            }
            if let Some(content) = msg.get("content") {
                content.to_string().hash(&mut hasher);
            }
        }
    } else {
        payload.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

// ============================================================================
// Streaming path: OpenAI chat chunks -> Claude SSE events
// ============================================================================

#[derive(Default)]
struct BlockState {
    thinking_index: Option<usize>,
    text_index: Option<usize>,
    tool_index: Option<usize>,
    next_index: usize,
}

impl BlockState {
    fn ensure_thinking(&mut self) -> (usize, bool) {
        if let Some(index) = self.thinking_index {
            return (index, false);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.thinking_index = Some(index);
        (index, true)
    }

    fn ensure_text(&mut self) -> (usize, bool) {
        if let Some(index) = self.text_index {
            return (index, false);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_index = Some(index);
        (index, true)
    }

    fn ensure_tool(&mut self) -> (usize, bool) {
        if let Some(index) = self.tool_index {
            return (index, false);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.tool_index = Some(index);
        (index, true)
    }

    fn close_thinking(&mut self) -> Option<usize> {
        self.thinking_index.take()
    }

    fn open_indices(&mut self) -> Vec<usize> {
        let mut open = Vec::new();
        if let Some(index) = self.thinking_index.take() {
            open.push(index);
        }
        if let Some(index) = self.text_index.take() {
            open.push(index);
        }
        if let Some(index) = self.tool_index.take() {
            open.push(index);
        }
        open.sort_unstable();
        open
    }
}

/// Stateful rewriter from OpenAI chat chunks to the Claude event sequence.
///
/// Consumes one upstream SSE payload per call and yields the Claude frames
/// it implies; `finish` closes open blocks and emits `message_stop`.
pub struct ClaudeStreamRewriter {
    first: bool,
    stop_sent: bool,
    blocks: BlockState,
    estimated_prompt_tokens: i64,
    pub completion_tokens: i64,
    pub final_usage: Option<Value>,
}

fn event_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

impl ClaudeStreamRewriter {
    pub fn new(estimated_prompt_tokens: i64) -> Self {
        Self {
            first: true,
            stop_sent: false,
            blocks: BlockState::default(),
            estimated_prompt_tokens,
            completion_tokens: 0,
            final_usage: None,
        }
    }

    fn message_start(&self, chunk: &Value) -> String {
        let id_raw = chunk
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("msg_unknown");
        let id = if id_raw.starts_with("msg_") {
            id_raw.to_string()
        } else {
            format!("msg_{}", id_raw)
        };
        let input_tokens = chunk
            .get("usage")
            .and_then(|v| v.get("prompt_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(self.estimated_prompt_tokens);
        let event = json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": chunk.get("model").cloned().unwrap_or(Value::String("unknown".to_string())),
                "stop_reason": Value::Null,
                "stop_sequence": Value::Null,
                "usage": { "input_tokens": input_tokens, "output_tokens": 0 }
            }
        });
        event_frame("message_start", &event)
    }

    fn block_start(index: usize, block_type: &str) -> String {
        let block = match block_type {
            "thinking" => json!({ "type": "thinking", "thinking": "" }),
            "tool_use" => json!({ "type": "tool_use", "id": "", "name": "", "input": {} }),
            _ => json!({ "type": "text", "text": "" }),
        };
        event_frame(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": block
            }),
        )
    }

    fn block_delta(index: usize, delta: Value) -> String {
        event_frame(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": delta
            }),
        )
    }

    fn block_stop(index: usize) -> String {
        event_frame(
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": index }),
        )
    }

    /// Rewrite one upstream payload into zero or more Claude frames.
    pub fn rewrite(&mut self, data: &str) -> Vec<String> {
        if crate::relay::client::is_sse_done(data) {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        let mut frames = Vec::new();

        if self.first {
            self.first = false;
            frames.push(self.message_start(&chunk));
        }

        if let Some(usage) = chunk.get("usage") {
            if usage.get("prompt_tokens").is_some() {
                self.final_usage = Some(usage.clone());
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|v| v.first())
        else {
            return frames;
        };

        if let Some(delta) = choice.get("delta") {
            let reasoning = delta
                .get("reasoning_content")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let content = delta.get("content").and_then(|v| v.as_str()).unwrap_or("");

            if !reasoning.is_empty() {
                let (index, started) = self.blocks.ensure_thinking();
                if started {
                    frames.push(Self::block_start(index, "thinking"));
                }
                frames.push(Self::block_delta(
                    index,
                    json!({ "type": "thinking_delta", "thinking": reasoning }),
                ));
                self.completion_tokens += estimate_tokens(reasoning);
            }

            if !content.is_empty() {
                if let Some(index) = self.blocks.close_thinking() {
                    frames.push(Self::block_stop(index));
                }
                let (index, started) = self.blocks.ensure_text();
                if started {
                    frames.push(Self::block_start(index, "text"));
                }
                frames.push(Self::block_delta(
                    index,
                    json!({ "type": "text_delta", "text": content }),
                ));
                self.completion_tokens += estimate_tokens(content);
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tool_call in tool_calls {
                    let (index, started) = self.blocks.ensure_tool();
                    if started {
                        let name = tool_call
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        let id = tool_call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("toolu_stream");
                        frames.push(event_frame(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": id,
                                    "name": name,
                                    "input": {}
                                }
                            }),
                        ));
                    }
                    if let Some(args) = tool_call
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                    {
                        if !args.is_empty() {
                            frames.push(Self::block_delta(
                                index,
                                json!({ "type": "input_json_delta", "partial_json": args }),
                            ));
                            self.completion_tokens += estimate_tokens(args);
                        }
                    }
                }
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason") {
            if !finish_reason.is_null() {
                for index in self.blocks.open_indices() {
                    frames.push(Self::block_stop(index));
                }
                let output_tokens = self
                    .final_usage
                    .as_ref()
                    .and_then(|u| u.get("completion_tokens"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(self.completion_tokens);
                frames.push(event_frame(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": map_chat_finish_reason(finish_reason.as_str()),
                            "stop_sequence": Value::Null
                        },
                        "usage": { "output_tokens": output_tokens }
                    }),
                ));
            }
        }

        frames
    }

    /// Close the stream: any still-open blocks stop, then `message_stop`.
    pub fn finish(&mut self) -> Vec<String> {
        if self.stop_sent {
            return Vec::new();
        }
        self.stop_sent = true;

        let mut frames = Vec::new();
        for index in self.blocks.open_indices() {
            frames.push(Self::block_stop(index));
        }
        frames.push(event_frame("message_stop", &json!({ "type": "message_stop" })));
        frames
    }
}

// ============================================================================
// Response path: Claude Messages -> OpenAI chat
// ============================================================================

fn claude_blocks_to_chat_message(content: &Value) -> (Value, Vec<Value>) {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    match content {
        Value::String(text) => {
            if !text.is_empty() {
                parts.push(json!({ "type": "text", "text": text }));
            }
        }
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" | "thinking" => {
                        if let Some(text) = text_from_claude_block(block) {
                            parts.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    "tool_use" => {
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                        let id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("tool_call");
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        let args =
                            serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": args }
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let content_value = if parts.is_empty() {
        Value::String(String::new())
    } else {
        chat_content_from_parts(parts)
    };

    (content_value, tool_calls)
}

/// Convert a buffered Claude response into a chat completion, for chat and
/// Response API clients served by a native Anthropic channel.
pub fn to_openai_response(response: &Value, model: &str) -> Value {
    let id = response
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| {
            if s.starts_with("chatcmpl-") {
                s.to_string()
            } else {
                format!("chatcmpl-{}", s)
            }
        })
        .unwrap_or_else(|| format!("chatcmpl-{}", chrono::Utc::now().timestamp()));

    let (content, tool_calls) = response
        .get("content")
        .map(claude_blocks_to_chat_message)
        .unwrap_or_else(|| (Value::String(String::new()), Vec::new()));

    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert("content".to_string(), content);
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let finish_reason = response
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(map_claude_stop_reason);

    let usage = crate::relay::context::parse_claude_usage(
        response.get("usage").unwrap_or(&Value::Null),
    );

    json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.get("model").cloned().unwrap_or_else(|| Value::String(model.to_string())),
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens(),
            "prompt_tokens_details": { "cached_tokens": usage.cached_prompt_tokens }
        }
    })
}

// ============================================================================
// Streaming path: Claude SSE events -> OpenAI chat chunks
// ============================================================================

/// Stateful rewriter from Claude events to chat completion chunks, ending
/// with the `[DONE]` sentinel.
pub struct ChatFromClaudeRewriter {
    id: String,
    created: i64,
    model: String,
    sent_role: bool,
    done_sent: bool,
    tool_call_index: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub usage: Option<Value>,
}

impl ChatFromClaudeRewriter {
    pub fn new(model: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{}", now),
            created: now,
            model: model.to_string(),
            sent_role: false,
            done_sent: false,
            tool_call_index: -1,
            prompt_tokens: 0,
            completion_tokens: 0,
            usage: None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<Value>, usage: Option<Value>) -> String {
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        format!("data: {}\n\n", body)
    }

    /// Rewrite one Claude event payload into zero or more chat frames.
    pub fn rewrite(&mut self, data: &str) -> Vec<String> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");

        let mut frames = Vec::new();

        match event_type {
            "message_start" => {
                if let Some(message) = event.get("message") {
                    let usage = crate::relay::context::parse_claude_usage(
                        message.get("usage").unwrap_or(&Value::Null),
                    );
                    self.prompt_tokens = usage.prompt_tokens;
                    if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                        self.id = format!("chatcmpl-{}", id);
                    }
                }
                if !self.sent_role {
                    self.sent_role = true;
                    frames.push(self.chunk(json!({ "role": "assistant" }), None, None));
                }
            }
            "content_block_start" => {
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        self.tool_call_index += 1;
                        frames.push(self.chunk(
                            json!({
                                "tool_calls": [{
                                    "index": self.tool_call_index,
                                    "id": block.get("id").cloned().unwrap_or(json!("tool_call")),
                                    "type": "function",
                                    "function": {
                                        "name": block.get("name").cloned().unwrap_or(json!("tool")),
                                        "arguments": ""
                                    }
                                }]
                            }),
                            None,
                            None,
                        ));
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.get("delta") {
                    match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                        "text_delta" => {
                            if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                self.completion_tokens += estimate_tokens(text);
                                frames.push(self.chunk(json!({ "content": text }), None, None));
                            }
                        }
                        "thinking_delta" => {
                            if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                                self.completion_tokens += estimate_tokens(text);
                                frames.push(self.chunk(
                                    json!({ "reasoning_content": text }),
                                    None,
                                    None,
                                ));
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) =
                                delta.get("partial_json").and_then(|v| v.as_str())
                            {
                                self.completion_tokens += estimate_tokens(partial);
                                frames.push(self.chunk(
                                    json!({
                                        "tool_calls": [{
                                            "index": self.tool_call_index.max(0),
                                            "function": { "arguments": partial }
                                        }]
                                    }),
                                    None,
                                    None,
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "message_delta" => {
                let stop_reason = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .map(map_claude_stop_reason)
                    .unwrap_or_else(|| "stop".to_string());
                if let Some(output_tokens) = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_i64())
                {
                    self.completion_tokens = output_tokens;
                }
                let usage = json!({
                    "prompt_tokens": self.prompt_tokens,
                    "completion_tokens": self.completion_tokens,
                    "total_tokens": self.prompt_tokens + self.completion_tokens
                });
                self.usage = Some(usage.clone());
                frames.push(self.chunk(json!({}), Some(json!(stop_reason)), Some(usage)));
            }
            "message_stop" => {
                frames.extend(self.finish());
            }
            _ => {}
        }

        frames
    }

    /// Emit the `[DONE]` sentinel once.
    pub fn finish(&mut self) -> Vec<String> {
        if self.done_sent {
            return Vec::new();
        }
        self.done_sent = true;
        vec!["data: [DONE]\n\n".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structured_claude_request() -> Value {
        json!({
            "model": "claude-sonnet-4-0",
            "max_tokens": 512,
            "messages": [
                {"role": "user", "content": "Extract the user and return JSON."}
            ],
            "tools": [{
                "name": "extract_user",
                "description": "Extract a user record",
                "input_schema": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "additionalProperties": false
                }
            }],
            "tool_choice": {"type": "tool", "name": "extract_user"}
        })
    }

    #[test]
    fn structured_output_promotion_fires() {
        let (converted, promoted) =
            to_openai_request(&structured_claude_request(), "gpt-4o", true).unwrap();
        assert_eq!(promoted.as_deref(), Some("extract_user"));
        assert!(converted.get("tools").is_none());
        assert!(converted.get("tool_choice").is_none());
        let format = converted.get("response_format").unwrap();
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["strict"], true);
        assert_eq!(format["json_schema"]["name"], "extract_user");
        assert_eq!(
            format["json_schema"]["schema"]["additionalProperties"],
            false
        );
    }

    #[test]
    fn promotion_skipped_without_keyword() {
        let mut request = structured_claude_request();
        request["messages"][0]["content"] = json!("Extract the user.");
        request["tools"][0]["description"] = json!("Extract a user record");
        let (converted, promoted) = to_openai_request(&request, "gpt-4o", true).unwrap();
        assert!(promoted.is_none());
        assert!(converted.get("tools").is_some());
    }

    #[test]
    fn promotion_skipped_with_tool_history() {
        let mut request = structured_claude_request();
        request["messages"] = json!([
            {"role": "user", "content": "return JSON please"},
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "t1", "name": "extract_user", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
            ]}
        ]);
        let (_, promoted) = to_openai_request(&request, "gpt-4o", true).unwrap();
        assert!(promoted.is_none());
    }

    #[test]
    fn promotion_respects_channel_opt_out() {
        let (_, promoted) =
            to_openai_request(&structured_claude_request(), "gpt-4o", false).unwrap();
        assert!(promoted.is_none());
    }

    #[test]
    fn promoted_response_folds_back_to_tool_use() {
        let response = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "{\"name\":\"Ada\"}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let claude = from_openai_response(&response, "claude-sonnet-4-0", Some("extract_user"));
        assert_eq!(claude["stop_reason"], "tool_use");
        assert_eq!(claude["content"][0]["type"], "tool_use");
        assert_eq!(claude["content"][0]["name"], "extract_user");
        assert_eq!(claude["content"][0]["input"]["name"], "Ada");
    }

    #[test]
    fn output_json_fragments_concatenate() {
        let request = json!({
            "model": "claude-sonnet-4-0",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "output_json_delta", "partial_json": "{\"a\":"},
                    {"type": "output_json_delta", "partial_json": "1}"}
                ]
            }]
        });
        let (converted, _) = to_openai_request(&request, "gpt-4o", false).unwrap();
        let content = converted["messages"][0]["content"].as_str().unwrap();
        assert_eq!(content, "{\"a\":1}");
    }

    #[test]
    fn finish_reasons_map_both_ways() {
        assert_eq!(map_chat_finish_reason(Some("stop")), "end_turn");
        assert_eq!(map_chat_finish_reason(Some("length")), "max_tokens");
        assert_eq!(map_chat_finish_reason(Some("tool_calls")), "tool_use");
        assert_eq!(map_chat_finish_reason(Some("content_filter")), "content_filter");
        assert_eq!(map_claude_stop_reason("end_turn"), "stop");
        assert_eq!(map_claude_stop_reason("max_tokens"), "length");
        assert_eq!(map_claude_stop_reason("tool_use"), "tool_calls");
        assert_eq!(map_claude_stop_reason("pause_turn"), "pause_turn");
    }

    fn roles_of(payload: &Value) -> Vec<String> {
        payload["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn chat_to_claude_round_trip_preserves_supported_subset() {
        let original = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "What is 2+2?"},
                {"role": "assistant", "content": "", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "add", "arguments": "{\"a\":2,\"b\":2}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "4"},
                {"role": "assistant", "content": "The answer is 4."}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "add",
                    "description": "Add two numbers",
                    "parameters": {"type": "object", "properties": {}}
                }
            }],
            "stop": ["<END>"],
            "max_tokens": 64
        });

        let claude = from_openai_request(&original, "claude-sonnet-4-0");
        let (back, _) = to_openai_request(&claude, "gpt-4o", false).unwrap();

        // System folds into `system` and back to the leading message.
        assert_eq!(
            roles_of(&back),
            vec!["system", "user", "assistant", "tool", "assistant"]
        );
        assert_eq!(back["messages"][0]["content"], "Be terse.");
        assert_eq!(back["messages"][1]["content"], "What is 2+2?");
        let tool_call = &back["messages"][2]["tool_calls"][0];
        assert_eq!(tool_call["function"]["name"], "add");
        assert_eq!(
            serde_json::from_str::<Value>(tool_call["function"]["arguments"].as_str().unwrap())
                .unwrap(),
            json!({"a": 2, "b": 2})
        );
        assert_eq!(back["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(back["messages"][3]["content"], "4");
        assert_eq!(back["messages"][4]["content"], "The answer is 4.");
        assert_eq!(back["tools"][0]["function"]["name"], "add");
        assert_eq!(back["stop"], json!(["<END>"]));
        assert_eq!(back["max_tokens"], 64);
    }

    #[test]
    fn stream_rewriter_emits_claude_sequence() {
        let mut rewriter = ClaudeStreamRewriter::new(12);

        let first = rewriter.rewrite(
            r#"{"id":"abc","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
        );
        assert!(first[0].contains("message_start"));
        assert!(first[0].contains("msg_abc"));
        assert!(first.iter().any(|f| f.contains("content_block_start")));
        assert!(first.iter().any(|f| f.contains("text_delta")));

        let middle = rewriter.rewrite(
            r#"{"id":"abc","choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
        );
        assert_eq!(
            middle
                .iter()
                .filter(|f| f.contains("content_block_start"))
                .count(),
            0
        );

        let last = rewriter.rewrite(
            r#"{"id":"abc","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":2}}"#,
        );
        assert!(last.iter().any(|f| f.contains("content_block_stop")));
        assert!(last.iter().any(|f| f.contains("\"stop_reason\":\"end_turn\"")));

        let done = rewriter.rewrite("[DONE]");
        assert!(done.iter().any(|f| f.contains("message_stop")));

        // A second finish is a no-op.
        assert!(rewriter.finish().is_empty());
    }

    #[test]
    fn claude_response_converts_to_chat_completion() {
        let response = json!({
            "id": "msg_01",
            "model": "claude-sonnet-4-0",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "toolu_1", "name": "add", "input": {"a": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 9, "output_tokens": 4}
        });
        let chat = to_openai_response(&response, "claude-sonnet-4-0");
        assert_eq!(chat["object"], "chat.completion");
        assert_eq!(chat["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(chat["choices"][0]["message"]["content"], "hello");
        assert_eq!(
            chat["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "add"
        );
        assert_eq!(chat["usage"]["prompt_tokens"], 9);
    }

    #[test]
    fn chat_from_claude_rewriter_sequence() {
        let mut rewriter = ChatFromClaudeRewriter::new("claude-sonnet-4-0");

        let start = rewriter.rewrite(
            r#"{"type":"message_start","message":{"id":"msg_7","usage":{"input_tokens":6,"output_tokens":0}}}"#,
        );
        assert!(start[0].contains("\"role\":\"assistant\""));
        assert_eq!(rewriter.prompt_tokens, 6);

        let delta = rewriter.rewrite(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hey"}}"#,
        );
        assert!(delta[0].contains("\"content\":\"hey\""));

        let finish = rewriter.rewrite(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
        );
        assert!(finish[0].contains("\"finish_reason\":\"stop\""));
        assert!(finish[0].contains("\"completion_tokens\":3"));

        let stop = rewriter.rewrite(r#"{"type":"message_stop"}"#);
        assert_eq!(stop, vec!["data: [DONE]\n\n".to_string()]);
        assert!(rewriter.finish().is_empty());
    }

    #[test]
    fn fingerprint_is_stable_and_byte_sensitive() {
        let a = json!({"messages": [{"role": "user", "content": "hi"}]});
        let b = json!({"messages": [{"role": "user", "content": "hi"}]});
        let c = json!({"messages": [{"role": "user", "content": "hi "}]});
        assert_eq!(conversation_fingerprint(&a), conversation_fingerprint(&b));
        assert_ne!(conversation_fingerprint(&a), conversation_fingerprint(&c));
    }
}
