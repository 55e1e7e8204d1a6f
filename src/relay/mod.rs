//! Relay controller
//!
//! One controller run per request: auth, model resolution, channel
//! selection, pre-consumption, adapter invocation, response conversion,
//! reconciliation, logging and tracing. Retries rotate channels until the
//! first byte reaches the client; after that the stream pump owns the
//! request to its end, cancellation included.

pub mod auth;
pub mod billing;
pub mod client;
pub mod context;
pub mod error;
pub mod scheduler;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dialect::{self, claude, response_api};
use crate::pricing::{self, ModelPrice, Usage};
use crate::store::traces::Milestone;
use crate::trace::TraceRecorder;
use crate::{adapters, config, logger, monitor, store};

use self::billing::StreamQuotaTracker;
use self::context::{
    estimate_tokens, parse_openai_usage, Dialect, RelayContext, RelayMode,
};
use self::error::{RelayError, RelayResult};

// ============================================================================
// Ingress handlers
// ============================================================================

/// OpenAI chat dialect. Route: POST /v1/chat/completions
pub async fn chat_completions(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_entry(Dialect::Chat, RelayMode::Chat, "/v1/chat/completions", headers, payload).await
}

/// Claude Messages dialect. Route: POST /v1/messages
pub async fn claude_messages(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_entry(Dialect::Claude, RelayMode::Chat, "/v1/messages", headers, payload).await
}

/// OpenAI Response API dialect. Route: POST /v1/responses
pub async fn responses(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_entry(Dialect::Response, RelayMode::Chat, "/v1/responses", headers, payload).await
}

/// Route: POST /v1/embeddings
pub async fn embeddings(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_entry(Dialect::Chat, RelayMode::Embeddings, "/v1/embeddings", headers, payload).await
}

/// Route: POST /v1/images/generations
pub async fn images_generations(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_entry(
        Dialect::Chat,
        RelayMode::ImageGeneration,
        "/v1/images/generations",
        headers,
        payload,
    )
    .await
}

/// Route: POST /v1/images/edits (multipart, relayed opaquely)
pub async fn images_edits(headers: HeaderMap, body: Bytes) -> Response {
    relay_opaque(RelayMode::ImageEdit, "/v1/images/edits", headers, body).await
}

/// Route: POST /v1/audio/speech
pub async fn audio_speech(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    relay_audio_speech(headers, payload).await
}

/// Route: POST /v1/audio/transcriptions (multipart, relayed opaquely)
pub async fn audio_transcriptions(headers: HeaderMap, body: Bytes) -> Response {
    relay_opaque(
        RelayMode::AudioTranscription,
        "/v1/audio/transcriptions",
        headers,
        body,
    )
    .await
}

/// Model catalogue in OpenAI list format. Route: GET /v1/models
pub async fn list_models(headers: HeaderMap) -> Response {
    if let Err(e) = auth::authenticate(&headers) {
        return e.into_response();
    }
    let mut models = store::abilities::all_models().unwrap_or_default();
    if models.is_empty() {
        models = adapters::all_default_models()
            .into_iter()
            .map(|(model, _)| model)
            .collect();
    }
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "created": 1700000000,
                "owned_by": "one-api",
                "root": m,
                "parent": Value::Null
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// Models visible to the calling identity's group.
/// Route: GET /api/models/display
pub async fn models_display(headers: HeaderMap) -> Response {
    let authed = match auth::authenticate(&headers) {
        Ok(authed) => authed,
        Err(e) => return e.into_response(),
    };
    let group = authed.user.group.clone();
    let models = match crate::cache::cached_models_for_group(&group) {
        Some(models) => models,
        None => {
            let models = store::abilities::models_for_group(&group).unwrap_or_default();
            crate::cache::set_models_for_group(&group, &models);
            models
        }
    };
    Json(json!({ "group": group, "models": models })).into_response()
}

// ============================================================================
// Entry and context construction
// ============================================================================

async fn relay_entry(
    dialect: Dialect,
    mode: RelayMode,
    path: &str,
    headers: HeaderMap,
    payload: Value,
) -> Response {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let body_size = payload.to_string().len() as i64;
    let recorder = TraceRecorder::start(&trace_id, path, "POST", body_size);

    let ctx = match build_context(dialect, mode, &trace_id, &headers, &payload) {
        Ok(ctx) => ctx,
        Err(e) => {
            recorder.record_status(e.status().as_u16());
            recorder.record_end(None);
            return e.into_response();
        }
    };

    match mode {
        RelayMode::Chat => run_relay(ctx, payload, recorder).await,
        RelayMode::Embeddings | RelayMode::ImageGeneration => {
            run_simple_relay(ctx, payload, recorder).await
        }
        _ => RelayError::NotFound("unsupported relay mode".to_string()).into_response(),
    }
}

fn build_context(
    dialect: Dialect,
    mode: RelayMode,
    trace_id: &str,
    headers: &HeaderMap,
    payload: &Value,
) -> RelayResult<RelayContext> {
    let authed = auth::authenticate(headers)?;
    let model = dialect::extract_model(payload)?;
    auth::check_model_allowed(&authed.token, &model)?;

    let group = authed.user.group.clone();
    let group_ratio = store::options::group_ratio(&group);
    let is_streaming = matches!(payload.get("stream"), Some(Value::Bool(true)))
        || payload
            .get("stream")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

    Ok(RelayContext {
        request_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        trace_id: trace_id.to_string(),
        dialect,
        mode,
        pinned_channel: authed.pinned_channel,
        token: authed.token,
        user: authed.user,
        group,
        group_ratio,
        original_model: model,
        is_streaming,
        channel: None,
        upstream_model: String::new(),
        claude_conversion: false,
        claude_promoted_tool: None,
        response_api_request: if dialect == Dialect::Response {
            Some(payload.clone())
        } else {
            None
        },
        started_at: Instant::now(),
    })
}

fn estimate_request_prompt_tokens(payload: &Value) -> i64 {
    let messages = payload
        .get("messages")
        .or_else(|| payload.get("input"))
        .map(|m| m.to_string())
        .unwrap_or_default();
    let system = payload
        .get("system")
        .or_else(|| payload.get("instructions"))
        .map(|s| s.to_string())
        .unwrap_or_default();
    estimate_tokens(&format!("{}{}", system, messages))
}

fn classify_upstream_error(status: StatusCode, body: &str) -> RelayError {
    let snippet = body.chars().take(500).collect::<String>();
    match status.as_u16() {
        401 | 403 => RelayError::Authentication(format!("Upstream rejected credentials: {}", snippet)),
        429 => RelayError::RateLimited(format!("Upstream rate limited: {}", snippet)),
        s if s >= 500 => RelayError::UpstreamError(format!("Upstream returned {}: {}", s, snippet)),
        s => RelayError::InvalidRequest(format!("Upstream returned {}: {}", s, snippet)),
    }
}

fn resolve_price(ctx: &RelayContext, adapter: &adapters::Adapter) -> ModelPrice {
    let channel = ctx.channel.as_ref().expect("channel selected");
    let default = adapter
        .default_pricing(&ctx.original_model)
        .or_else(|| adapter.default_pricing(&ctx.upstream_model));
    pricing::resolve(&ctx.original_model, channel, default)
}

// ============================================================================
// Main chat controller
// ============================================================================

async fn run_relay(mut ctx: RelayContext, payload: Value, recorder: TraceRecorder) -> Response {
    let cfg = config::load();
    let estimated_prompt = estimate_request_prompt_tokens(&payload);
    let mut pre_consumed: i64 = 0;
    let mut last_error = RelayError::RateLimited(format!(
        "no_available_channel for model '{}' in group '{}'",
        ctx.original_model, ctx.group
    ));

    for attempt in 0..=cfg.retry_times {
        let channel =
            match scheduler::select_channel(&ctx.original_model, &ctx.group, ctx.pinned_channel) {
                Ok(channel) => channel,
                Err(e) => {
                    last_error = e;
                    break;
                }
            };
        let channel_id = channel.id;
        ctx.upstream_model = channel.rewrite_model(&ctx.original_model);
        let adapter = adapters::for_channel_type(channel.channel_type);
        ctx.channel = Some(channel);
        let price = resolve_price(&ctx, &adapter);

        // Dialect conversion. Conversion failures are terminal: another
        // channel of the same family would refuse the same request.
        let converted = match ctx.dialect {
            Dialect::Chat => adapter.convert_request(&ctx, &payload),
            Dialect::Claude => match adapter.convert_claude_request(&ctx, &payload) {
                Ok((converted, promoted)) => {
                    ctx.claude_conversion = adapter.native_dialect() == Dialect::Chat;
                    ctx.claude_promoted_tool = promoted;
                    Ok(converted)
                }
                Err(e) => Err(e),
            },
            Dialect::Response => adapter.convert_response_api_request(&ctx, &payload),
        };
        let converted = match converted {
            Ok(converted) => converted,
            Err(e) => {
                last_error = e;
                break;
            }
        };

        // Reservation happens once, before any upstream byte, and survives
        // channel retries.
        if pre_consumed == 0 {
            pre_consumed = match billing::pre_consume(
                ctx.token.id,
                ctx.user.id,
                estimated_prompt,
                &price,
                ctx.group_ratio,
            ) {
                Ok(amount) => amount,
                Err(e) => return finalize_error(&ctx, &recorder, 0, e),
            };
        }

        recorder.record(Milestone::Forwarded);
        let http_client = match client::streaming_client() {
            Ok(client) => client,
            Err(e) => return finalize_error(&ctx, &recorder, pre_consumed, e),
        };

        let attempt_result = adapter.do_request(&ctx, &http_client, &converted).await;
        let upstream = match attempt_result {
            Ok(upstream) => upstream,
            Err(e) => {
                scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, e.outcome());
                monitor::report_failure(channel_id);
                if e.is_retryable() && attempt < cfg.retry_times {
                    logger::warn(
                        "relay",
                        &format!(
                            "Attempt {} failed on channel {}: {}; retrying",
                            attempt, channel_id, e
                        ),
                    );
                    tokio::time::sleep(client::calculate_retry_delay(attempt + 1)).await;
                    last_error = e;
                    continue;
                }
                last_error = e;
                break;
            }
        };

        recorder.record(Milestone::FirstUpstreamResponse);
        let status = upstream.response.status();
        if !status.is_success() {
            let text = upstream.response.text().await.unwrap_or_default();
            let err = classify_upstream_error(status, &text);
            scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, err.outcome());
            monitor::report_failure(channel_id);
            if err.is_retryable() && attempt < cfg.retry_times {
                logger::warn(
                    "relay",
                    &format!(
                        "Upstream {} from channel {}; retrying with another channel",
                        status, channel_id
                    ),
                );
                tokio::time::sleep(client::calculate_retry_delay(attempt + 1)).await;
                last_error = err;
                continue;
            }
            last_error = err;
            break;
        }

        // From here the response is committed to this channel: no retry
        // once bytes can reach the client.
        if ctx.is_streaming {
            return stream_response(
                ctx,
                adapter,
                upstream.response,
                recorder,
                pre_consumed,
                price,
                estimated_prompt,
            );
        }
        return buffered_response(
            ctx,
            adapter,
            upstream.response,
            recorder,
            pre_consumed,
            price,
            estimated_prompt,
        )
        .await;
    }

    finalize_error(&ctx, &recorder, pre_consumed, last_error)
}

/// Error exit: refund the reservation, write the log row with the original
/// model name, close the trace.
fn finalize_error(
    ctx: &RelayContext,
    recorder: &TraceRecorder,
    pre_consumed: i64,
    err: RelayError,
) -> Response {
    let delta = if pre_consumed > 0 {
        billing::reconcile(ctx.token.id, ctx.user.id, 0, pre_consumed)
    } else {
        0
    };
    let quota = pre_consumed + delta;

    let detail = err.to_string();
    let log_id = store::logs::record_usage(&store::logs::UsageRecord {
        user_id: ctx.user.id,
        token_id: ctx.token.id,
        channel_id: ctx.channel_id(),
        model: &ctx.original_model,
        request_id: &ctx.request_id,
        prompt_tokens: 0,
        completion_tokens: 0,
        quota,
        latency_ms: ctx.latency_ms(),
        detail: Some(&detail),
        trace_id: &ctx.trace_id,
    })
    .ok();

    recorder.record_status(err.status().as_u16());
    recorder.record_end(log_id);
    err.into_response()
}

// ============================================================================
// Buffered responses
// ============================================================================

async fn buffered_response(
    ctx: RelayContext,
    adapter: adapters::Adapter,
    response: reqwest::Response,
    recorder: TraceRecorder,
    pre_consumed: i64,
    price: ModelPrice,
    estimated_prompt: i64,
) -> Response {
    let channel_id = ctx.channel_id();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            let err = RelayError::UpstreamError(format!("Failed to read response: {}", e));
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, err);
        }
    };
    recorder.record(Milestone::UpstreamCompleted);

    let body = match client::parse_json_response(&text) {
        Ok(body) => body,
        Err(e) => {
            let err =
                RelayError::UpstreamError(format!("Failed to parse upstream response: {}", e));
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, err);
        }
    };

    let (client_body, mut usage) = match adapter.parse_buffered_response(&ctx, &body) {
        Ok(parsed) => parsed,
        Err(e) => {
            monitor::report_failure(channel_id);
            scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, e.outcome());
            return finalize_error(&ctx, &recorder, pre_consumed, e);
        }
    };
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = estimated_prompt;
    }

    recorder.record(Milestone::FirstClientResponse);
    settle_and_log(&ctx, &recorder, pre_consumed, &price, usage, None);
    monitor::report_success(channel_id);

    (StatusCode::OK, Json(client_body)).into_response()
}

/// Reconcile, log, trace. The recorded quota equals everything actually
/// charged: reservation plus streaming flushes plus the reconcile delta.
fn settle_and_log(
    ctx: &RelayContext,
    recorder: &TraceRecorder,
    already_charged: i64,
    price: &ModelPrice,
    usage: Usage,
    detail: Option<&str>,
) {
    let computed = pricing::compute_quota(&usage, price, ctx.group_ratio);
    let delta = billing::reconcile(ctx.token.id, ctx.user.id, computed.total, already_charged);
    let quota = already_charged + delta;

    let log_id = store::logs::record_usage(&store::logs::UsageRecord {
        user_id: ctx.user.id,
        token_id: ctx.token.id,
        channel_id: ctx.channel_id(),
        model: &ctx.original_model,
        request_id: &ctx.request_id,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        quota,
        latency_ms: ctx.latency_ms(),
        detail,
        trace_id: &ctx.trace_id,
    })
    .ok();

    recorder.record_status(if detail.is_some() { 499 } else { 200 });
    recorder.record_end(log_id);

    logger::info(
        "relay",
        &format!(
            "Request settled: model={}, tokens={}/{}, quota={}, channel={}",
            ctx.original_model, usage.prompt_tokens, usage.completion_tokens, quota, ctx.channel_id()
        ),
    );
}

// ============================================================================
// Streaming responses
// ============================================================================

/// Per-dialect SSE rewriting for the pump.
enum StreamRewriter {
    /// chat client on a chat upstream; frames forward as-is.
    PassthroughChat { done_sent: bool },
    /// claude client on a claude upstream.
    PassthroughClaude,
    ClaudeFromChat(claude::ClaudeStreamRewriter),
    ResponseFromChat(response_api::ResponseStreamRewriter),
    ChatFromClaude(claude::ChatFromClaudeRewriter),
    ResponseFromClaude {
        inner: claude::ChatFromClaudeRewriter,
        outer: response_api::ResponseStreamRewriter,
    },
}

impl StreamRewriter {
    fn new(dialect: Dialect, native: Dialect, ctx: &RelayContext, estimated_prompt: i64) -> Self {
        match (dialect, native) {
            (Dialect::Chat, Dialect::Chat) => StreamRewriter::PassthroughChat { done_sent: false },
            (Dialect::Claude, Dialect::Claude) => StreamRewriter::PassthroughClaude,
            (Dialect::Claude, _) => {
                StreamRewriter::ClaudeFromChat(claude::ClaudeStreamRewriter::new(estimated_prompt))
            }
            (Dialect::Response, Dialect::Chat) => StreamRewriter::ResponseFromChat(
                response_api::ResponseStreamRewriter::new(&ctx.original_model),
            ),
            (Dialect::Response, _) => StreamRewriter::ResponseFromClaude {
                inner: claude::ChatFromClaudeRewriter::new(&ctx.original_model),
                outer: response_api::ResponseStreamRewriter::new(&ctx.original_model),
            },
            (Dialect::Chat, _) => {
                StreamRewriter::ChatFromClaude(claude::ChatFromClaudeRewriter::new(
                    &ctx.original_model,
                ))
            }
        }
    }
}

struct FinalizeData {
    ctx: RelayContext,
    recorder: TraceRecorder,
    tracker: Arc<StreamQuotaTracker>,
    price: ModelPrice,
}

fn finalize_stream_billing(data: FinalizeData, detail: Option<String>, success: bool) {
    let usage = data.tracker.final_flush();
    if success {
        monitor::report_success(data.ctx.channel_id());
    }
    settle_and_log(
        &data.ctx,
        &data.recorder,
        data.tracker.total_charged(),
        &data.price,
        usage,
        detail.as_deref(),
    );
}

/// Ensures one final flush and a log row even when the client vanishes:
/// dropping the guard mid-stream settles the request as cancelled.
struct StreamFinalizer {
    data: Option<FinalizeData>,
}

impl StreamFinalizer {
    fn finalize(&mut self, detail: Option<String>, success: bool) {
        if let Some(data) = self.data.take() {
            finalize_stream_billing(data, detail, success);
        }
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // Client disconnect: settle off the request task so the drop
            // stays cheap.
            tokio::spawn(async move {
                finalize_stream_billing(data, Some("client_cancelled".to_string()), false);
            });
        }
    }
}

struct StreamPump {
    upstream: Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<Bytes>> + Send>>,
    rewriter: StreamRewriter,
    tracker: Arc<StreamQuotaTracker>,
    finalizer: StreamFinalizer,
    recorder: TraceRecorder,
    line_buffer: Vec<u8>,
    idle_timeout: Duration,
    first_client_frame: bool,
    claude_prompt_tokens: i64,
    finished: bool,
}

impl StreamPump {
    /// Billing observation for one chat-shaped chunk: authoritative usage
    /// when present, delta estimates otherwise.
    fn observe_chat_chunk(&self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if let Some(usage) = chunk.get("usage") {
            if usage.get("prompt_tokens").is_some() {
                self.tracker.set_final_usage(parse_openai_usage(usage));
            }
        }
        if let Some(choices) = chunk.get("choices").and_then(|c| c.as_array()) {
            for choice in choices {
                if let Some(delta) = choice.get("delta") {
                    for key in ["content", "reasoning_content"] {
                        if let Some(text) = delta.get(key).and_then(|v| v.as_str()) {
                            self.tracker.record_completion(estimate_tokens(text));
                        }
                    }
                }
            }
        }
    }

    /// Billing observation for one Claude event, cache buckets included.
    fn observe_claude_event(&mut self, data: &str) {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                    let parsed = context::parse_claude_usage(usage);
                    self.claude_prompt_tokens = parsed.prompt_tokens;
                }
            }
            "content_block_delta" => {
                if let Some(text) = event
                    .get("delta")
                    .and_then(|d| {
                        d.get("text")
                            .or_else(|| d.get("thinking"))
                            .or_else(|| d.get("partial_json"))
                    })
                    .and_then(|v| v.as_str())
                {
                    self.tracker.record_completion(estimate_tokens(text));
                }
            }
            "message_delta" => {
                if let Some(usage) = event.get("usage") {
                    let mut parsed = context::parse_claude_usage(usage);
                    if parsed.prompt_tokens == 0 {
                        parsed.prompt_tokens = self.claude_prompt_tokens;
                    }
                    self.tracker.set_final_usage(parsed);
                }
            }
            _ => {}
        }
    }

    /// Rewrite one complete SSE line into client frames. The tracker is
    /// fed straight from the wire, independent of the rewriters, so the
    /// billing view never depends on which dialect goes back out.
    fn process_line(&mut self, line: &str) -> Vec<String> {
        if line.is_empty() {
            return Vec::new();
        }
        if line.starts_with("event:") {
            // Event labels ride along only for Claude passthrough; every
            // rewriter regenerates its own labels.
            if matches!(self.rewriter, StreamRewriter::PassthroughClaude) {
                return vec![format!("{}\n", line)];
            }
            return Vec::new();
        }
        let Some(data) = client::parse_sse_data(line) else {
            return Vec::new();
        };
        let data = data.to_string();

        // Feed the tracker first; the rewriter borrow comes after.
        let upstream_is_claude = matches!(
            self.rewriter,
            StreamRewriter::PassthroughClaude
                | StreamRewriter::ChatFromClaude(_)
                | StreamRewriter::ResponseFromClaude { .. }
        );
        if !client::is_sse_done(&data) {
            if upstream_is_claude {
                self.observe_claude_event(&data);
            } else {
                self.observe_chat_chunk(&data);
            }
        }

        match &mut self.rewriter {
            StreamRewriter::PassthroughChat { done_sent } => {
                if client::is_sse_done(&data) {
                    *done_sent = true;
                    return vec!["data: [DONE]\n\n".to_string()];
                }
                vec![format!("data: {}\n\n", data)]
            }
            StreamRewriter::PassthroughClaude => {
                vec![format!("data: {}\n\n", data)]
            }
            StreamRewriter::ClaudeFromChat(rewriter) => rewriter.rewrite(&data),
            StreamRewriter::ResponseFromChat(rewriter) => rewriter.rewrite(&data),
            StreamRewriter::ChatFromClaude(rewriter) => rewriter.rewrite(&data),
            StreamRewriter::ResponseFromClaude { inner, outer } => {
                let chat_frames = inner.rewrite(&data);
                let mut frames = Vec::new();
                for chat_frame in chat_frames {
                    for line in chat_frame.lines() {
                        if let Some(payload) = client::parse_sse_data(line) {
                            frames.extend(outer.rewrite(payload));
                        }
                    }
                }
                frames
            }
        }
    }

    /// Frames that close the stream in the client's dialect.
    fn closing_frames(&mut self) -> Vec<String> {
        match &mut self.rewriter {
            StreamRewriter::PassthroughChat { done_sent } => {
                if *done_sent {
                    Vec::new()
                } else {
                    // A usage-only stream still terminates with the sentinel.
                    *done_sent = true;
                    vec!["data: [DONE]\n\n".to_string()]
                }
            }
            StreamRewriter::PassthroughClaude => Vec::new(),
            StreamRewriter::ClaudeFromChat(rewriter) => rewriter.finish(),
            StreamRewriter::ResponseFromChat(rewriter) => rewriter.finish(),
            StreamRewriter::ChatFromClaude(rewriter) => rewriter.finish(),
            StreamRewriter::ResponseFromClaude { outer, .. } => outer.finish(),
        }
    }
}

fn stream_response(
    ctx: RelayContext,
    adapter: adapters::Adapter,
    response: reqwest::Response,
    recorder: TraceRecorder,
    pre_consumed: i64,
    price: ModelPrice,
    estimated_prompt: i64,
) -> Response {
    let cfg = config::load();

    let tracker = Arc::new(StreamQuotaTracker::new(
        ctx.token.id,
        ctx.user.id,
        price,
        ctx.group_ratio,
        pre_consumed,
        estimated_prompt,
    ));

    let rewriter = StreamRewriter::new(ctx.dialect, adapter.native_dialect(), &ctx, estimated_prompt);
    let finalizer = StreamFinalizer {
        data: Some(FinalizeData {
            ctx: ctx.clone(),
            recorder: recorder.clone(),
            tracker: Arc::clone(&tracker),
            price,
        }),
    };

    let pump = StreamPump {
        upstream: Box::pin(response.bytes_stream()),
        rewriter,
        tracker,
        finalizer,
        recorder,
        line_buffer: Vec::new(),
        idle_timeout: Duration::from_secs(cfg.idle_timeout_secs.max(1)),
        first_client_frame: true,
        claude_prompt_tokens: 0,
        finished: false,
    };

    let stream = futures_util::stream::unfold(pump, |mut pump| async move {
        if pump.finished {
            return None;
        }
        loop {
            let next = tokio::time::timeout(pump.idle_timeout, pump.upstream.next()).await;
            let mut frames: Vec<String> = Vec::new();

            match next {
                Err(_) => {
                    // Idle timeout between frames: terminal error frame,
                    // then close; the drop of `upstream` cancels the call.
                    let err = RelayError::UpstreamTimeout(
                        "No upstream frame within the idle timeout".to_string(),
                    );
                    frames.push(err.to_sse_frame());
                    frames.extend(pump.closing_frames());
                    pump.finished = true;
                    pump.recorder.record(Milestone::UpstreamCompleted);
                    pump.finalizer
                        .finalize(Some("upstream_idle_timeout".to_string()), false);
                }
                Ok(None) => {
                    frames.extend(pump.closing_frames());
                    pump.finished = true;
                    pump.recorder.record(Milestone::UpstreamCompleted);
                    pump.finalizer.finalize(None, true);
                }
                Ok(Some(Err(e))) => {
                    let err = RelayError::UpstreamError(format!("Stream error: {}", e));
                    frames.push(err.to_sse_frame());
                    frames.extend(pump.closing_frames());
                    pump.finished = true;
                    pump.recorder.record(Milestone::UpstreamCompleted);
                    pump.finalizer
                        .finalize(Some("upstream_stream_error".to_string()), false);
                }
                Ok(Some(Ok(bytes))) => {
                    let lines = {
                        let mut buffer = std::mem::take(&mut pump.line_buffer);
                        let lines = client::drain_sse_lines(&mut buffer, bytes.as_ref());
                        pump.line_buffer = buffer;
                        lines
                    };
                    for line in lines {
                        frames.extend(pump.process_line(&line));
                    }

                    // Cooperative billing flush; exhaustion cancels the
                    // upstream and ends the stream with the error envelope.
                    if let Err(e) = pump.tracker.maybe_flush() {
                        frames.push(e.to_sse_frame());
                        frames.extend(pump.closing_frames());
                        pump.finished = true;
                        pump.finalizer
                            .finalize(Some("insufficient_quota".to_string()), false);
                    }
                }
            }

            if frames.is_empty() {
                if pump.finished {
                    return None;
                }
                continue;
            }

            if pump.first_client_frame {
                pump.first_client_frame = false;
                pump.recorder.record(Milestone::FirstClientResponse);
            }
            let chunk = Bytes::from(frames.concat());
            return Some((Ok::<Bytes, std::io::Error>(chunk), pump));
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            logger::error("relay", &format!("Failed to build stream response: {}", e));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

// ============================================================================
// Embeddings and image generation
// ============================================================================

async fn run_simple_relay(
    mut ctx: RelayContext,
    payload: Value,
    recorder: TraceRecorder,
) -> Response {
    let channel = match scheduler::select_channel(&ctx.original_model, &ctx.group, ctx.pinned_channel)
    {
        Ok(channel) => channel,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };
    let channel_id = channel.id;
    ctx.upstream_model = channel.rewrite_model(&ctx.original_model);
    let adapter = adapters::for_channel_type(channel.channel_type);
    ctx.channel = Some(channel);
    let price = resolve_price(&ctx, &adapter);

    let converted = match ctx.mode {
        RelayMode::Embeddings => adapter.convert_embedding_request(&ctx, &payload),
        RelayMode::ImageGeneration => adapter.convert_image_request(&ctx, &payload),
        _ => Err(RelayError::Internal("unexpected relay mode".to_string())),
    };
    let converted = match converted {
        Ok(converted) => converted,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };

    let estimated_prompt = estimate_request_prompt_tokens(&payload);
    let pre_consumed = match billing::pre_consume(
        ctx.token.id,
        ctx.user.id,
        estimated_prompt,
        &price,
        ctx.group_ratio,
    ) {
        Ok(amount) => amount,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };

    recorder.record(Milestone::Forwarded);
    let http_client = match client::default_client() {
        Ok(client) => client,
        Err(e) => return finalize_error(&ctx, &recorder, pre_consumed, e),
    };
    let upstream = match adapter.do_request(&ctx, &http_client, &converted).await {
        Ok(upstream) => upstream,
        Err(e) => {
            scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, e.outcome());
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, e);
        }
    };
    recorder.record(Milestone::FirstUpstreamResponse);

    let status = upstream.response.status();
    let text = upstream.response.text().await.unwrap_or_default();
    if !status.is_success() {
        let err = classify_upstream_error(status, &text);
        scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, err.outcome());
        monitor::report_failure(channel_id);
        return finalize_error(&ctx, &recorder, pre_consumed, err);
    }
    recorder.record(Milestone::UpstreamCompleted);

    let body = match client::parse_json_response(&text) {
        Ok(body) => body,
        Err(e) => {
            let err = RelayError::UpstreamError(format!("Failed to parse response: {}", e));
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, err);
        }
    };

    let usage = match ctx.mode {
        RelayMode::ImageGeneration => {
            let image_count = body
                .get("data")
                .and_then(|d| d.as_array())
                .map(|d| d.len() as i64)
                .unwrap_or(1);
            Usage {
                tools_cost: pricing::image_quota(image_count, &price, ctx.group_ratio),
                ..Usage::default()
            }
        }
        _ => parse_openai_usage(body.get("usage").unwrap_or(&Value::Null)),
    };

    recorder.record(Milestone::FirstClientResponse);
    settle_and_log(&ctx, &recorder, pre_consumed, &price, usage, None);
    monitor::report_success(channel_id);
    (StatusCode::OK, Json(body)).into_response()
}

// ============================================================================
// Opaque relays (multipart image edits, audio)
// ============================================================================

/// Relay a request body without interpreting it, for multipart surfaces.
/// The model rides in a header-free form field we cannot cheaply parse, so
/// these surfaces bill from the upstream usage block or fall back to the
/// body size estimate.
async fn relay_opaque(mode: RelayMode, path: &str, headers: HeaderMap, body: Bytes) -> Response {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let recorder = TraceRecorder::start(&trace_id, path, "POST", body.len() as i64);

    let authed = match auth::authenticate(&headers) {
        Ok(authed) => authed,
        Err(e) => {
            recorder.record_status(e.status().as_u16());
            recorder.record_end(None);
            return e.into_response();
        }
    };

    // Multipart bodies carry the model as a form field; take it from the
    // query-style header override or fall back to whisper-1.
    let model = headers
        .get("x-oneapi-model")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("whisper-1")
        .to_string();

    let group = authed.user.group.clone();
    let group_ratio = store::options::group_ratio(&group);
    let mut ctx = RelayContext {
        request_id: format!("req-{}", uuid::Uuid::new_v4().simple()),
        trace_id: trace_id.clone(),
        dialect: Dialect::Chat,
        mode,
        pinned_channel: authed.pinned_channel,
        token: authed.token,
        user: authed.user,
        group,
        group_ratio,
        original_model: model,
        is_streaming: false,
        channel: None,
        upstream_model: String::new(),
        claude_conversion: false,
        claude_promoted_tool: None,
        response_api_request: None,
        started_at: Instant::now(),
    };

    let channel = match scheduler::select_channel(&ctx.original_model, &ctx.group, ctx.pinned_channel)
    {
        Ok(channel) => channel,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };
    let channel_id = channel.id;
    ctx.upstream_model = channel.rewrite_model(&ctx.original_model);
    let adapter = adapters::for_channel_type(channel.channel_type);
    ctx.channel = Some(channel);
    let price = resolve_price(&ctx, &adapter);

    let pre_consumed = match billing::pre_consume(ctx.token.id, ctx.user.id, 0, &price, ctx.group_ratio)
    {
        Ok(amount) => amount,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };

    let url = match adapter.request_url(&ctx) {
        Ok(url) => url,
        Err(e) => return finalize_error(&ctx, &recorder, pre_consumed, e),
    };
    let mut upstream_headers = reqwest::header::HeaderMap::new();
    adapter.setup_headers(&ctx, &mut upstream_headers);
    upstream_headers.remove("content-type");
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    recorder.record(Milestone::Forwarded);
    let http_client = match client::default_client() {
        Ok(client) => client,
        Err(e) => return finalize_error(&ctx, &recorder, pre_consumed, e),
    };
    let attempt = match client::post_bytes(
        &http_client,
        &url,
        upstream_headers,
        &content_type,
        body.to_vec(),
    )
    .await
    {
        Ok(attempt) => attempt,
        Err(e) => {
            scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, e.outcome());
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, e);
        }
    };
    recorder.record(Milestone::FirstUpstreamResponse);

    let status = attempt.response.status();
    let response_body = attempt.response.bytes().await.unwrap_or_default();
    recorder.record(Milestone::UpstreamCompleted);
    if !status.is_success() {
        let text = String::from_utf8_lossy(&response_body).to_string();
        let err = classify_upstream_error(status, &text);
        scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, err.outcome());
        monitor::report_failure(channel_id);
        return finalize_error(&ctx, &recorder, pre_consumed, err);
    }

    let usage = serde_json::from_slice::<Value>(&response_body)
        .ok()
        .and_then(|v| v.get("usage").cloned())
        .map(|u| parse_openai_usage(&u))
        .unwrap_or(Usage {
            prompt_tokens: estimate_tokens(&String::from_utf8_lossy(&response_body)),
            ..Usage::default()
        });

    recorder.record(Milestone::FirstClientResponse);
    settle_and_log(&ctx, &recorder, pre_consumed, &price, usage, None);
    monitor::report_success(channel_id);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(response_body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Text-to-speech: JSON request, binary response, billed by input length.
async fn relay_audio_speech(headers: HeaderMap, payload: Value) -> Response {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let body_size = payload.to_string().len() as i64;
    let recorder = TraceRecorder::start(&trace_id, "/v1/audio/speech", "POST", body_size);

    let mut ctx = match build_context(
        Dialect::Chat,
        RelayMode::AudioSpeech,
        &trace_id,
        &headers,
        &payload,
    ) {
        Ok(ctx) => ctx,
        Err(e) => {
            recorder.record_status(e.status().as_u16());
            recorder.record_end(None);
            return e.into_response();
        }
    };

    let channel = match scheduler::select_channel(&ctx.original_model, &ctx.group, ctx.pinned_channel)
    {
        Ok(channel) => channel,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };
    let channel_id = channel.id;
    ctx.upstream_model = channel.rewrite_model(&ctx.original_model);
    let adapter = adapters::for_channel_type(channel.channel_type);
    ctx.channel = Some(channel);
    let price = resolve_price(&ctx, &adapter);

    let input_chars = payload
        .get("input")
        .and_then(|v| v.as_str())
        .map(|s| s.chars().count() as i64)
        .unwrap_or(0);
    let pre_consumed = match billing::pre_consume(
        ctx.token.id,
        ctx.user.id,
        input_chars,
        &price,
        ctx.group_ratio,
    ) {
        Ok(amount) => amount,
        Err(e) => return finalize_error(&ctx, &recorder, 0, e),
    };

    let mut body = payload.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(ctx.upstream_model.clone()));
    }

    recorder.record(Milestone::Forwarded);
    let http_client = match client::default_client() {
        Ok(client) => client,
        Err(e) => return finalize_error(&ctx, &recorder, pre_consumed, e),
    };
    let upstream = match adapter.do_request(&ctx, &http_client, &body).await {
        Ok(upstream) => upstream,
        Err(e) => {
            scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, e.outcome());
            monitor::report_failure(channel_id);
            return finalize_error(&ctx, &recorder, pre_consumed, e);
        }
    };
    recorder.record(Milestone::FirstUpstreamResponse);

    let status = upstream.response.status();
    if !status.is_success() {
        let text = upstream.response.text().await.unwrap_or_default();
        let err = classify_upstream_error(status, &text);
        scheduler::report_outcome(channel_id, &ctx.original_model, &ctx.group, err.outcome());
        monitor::report_failure(channel_id);
        return finalize_error(&ctx, &recorder, pre_consumed, err);
    }

    let content_type = upstream
        .response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/mpeg")
        .to_string();
    let audio = upstream.response.bytes().await.unwrap_or_default();
    recorder.record(Milestone::UpstreamCompleted);

    // Speech bills by input characters, treated as prompt tokens.
    let usage = Usage {
        prompt_tokens: input_chars,
        ..Usage::default()
    };
    recorder.record(Milestone::FirstClientResponse);
    settle_and_log(&ctx, &recorder, pre_consumed, &price, usage, None);
    monitor::report_success(channel_id);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .body(Body::from(audio))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============================================================================
// Status surfaces
// ============================================================================

#[derive(Deserialize)]
pub struct ChannelStatusQuery {
    pub p: Option<i64>,
    pub size: Option<i64>,
}

/// Paginated channel health. Route: GET /api/status/channel
pub async fn channel_status(Query(q): Query<ChannelStatusQuery>) -> Response {
    let page = q.p.unwrap_or(1).max(1);
    let size = q.size.unwrap_or(20).clamp(1, 100);
    match store::channels::list_page(page, size) {
        Ok((channels, total)) => {
            let data: Vec<Value> = channels
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "name": c.name,
                        "type": c.channel_type,
                        "status": c.status,
                        "priority": c.priority,
                        "weight": c.weight,
                        "response_time_ms": c.response_time_ms,
                        "test_at": c.test_at,
                        "balance": c.balance,
                        "balance_updated_at": c.balance_updated_at,
                    })
                })
                .collect();
            Json(json!({ "data": data, "total": total, "page": page, "size": size }))
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Trace detail by paired log id. Route: GET /api/trace/log/{id}
pub async fn trace_detail(Path(log_id): Path<i64>) -> Response {
    match store::traces::get_by_log(log_id) {
        Ok(Some(record)) => Json(crate::trace::render(&record)).into_response(),
        Ok(None) => crate::error::AppError::NotFound(format!(
            "No trace paired with log {}",
            log_id
        ))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::channels::NewChannel;
    use crate::testutil;
    use axum::routing::post;
    use axum::Router;

    async fn spawn_app() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::server::app();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    fn mock_chat_completion() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|Json(req): Json<Value>| async move {
                Json(json!({
                    "id": "chatcmpl-mock",
                    "object": "chat.completion",
                    "created": 1700000000,
                    "model": req["model"],
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "pong"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 8, "completion_tokens": 3, "total_tokens": 11}
                }))
            }),
        )
    }

    fn mock_unavailable() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": {"message": "overloaded"}})),
                )
            }),
        )
    }

    fn seed_identity(quota: i64) -> (i64, String) {
        let user_id =
            store::users::create(store::users::ROLE_COMMON, "default", quota, "").unwrap();
        let (_, key) = store::tokens::create(&store::tokens::NewToken {
            user_id,
            name: "relay-test",
            quota,
            unlimited: false,
            models: "",
            channel_pin: None,
            expires_at: None,
        })
        .unwrap();
        (user_id, key)
    }

    fn seed_channel(model: &str, base_url: &str, priority: i64) -> i64 {
        store::channels::create(&NewChannel {
            channel_type: crate::adapters::TYPE_OPENAI,
            name: "relay-test-channel",
            priority,
            weight: 1,
            groups: "default",
            models: model,
            base_url,
            key: "upstream-key",
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn chat_non_streaming_end_to_end() {
        let (user_id, key) = {
            let _guard = testutil::setup();
            seed_identity(1_000_000)
        };
        let upstream = spawn_mock(mock_chat_completion()).await;
        {
            let _guard = testutil::setup();
            seed_channel("s1-model", &upstream, 0);
        }
        let gateway = spawn_app().await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/chat/completions", gateway))
            .bearer_auth(&key)
            .json(&json!({
                "model": "s1-model",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "pong");

        let _guard = testutil::setup();
        // One usage row with the requested model name and real token counts.
        let log = store::logs::recent(50, 0)
            .unwrap()
            .into_iter()
            .find(|l| l.model == "s1-model")
            .expect("usage log row");
        assert_eq!(log.log_type, store::logs::TYPE_USAGE);
        assert!(log.prompt_tokens > 0 && log.completion_tokens > 0);
        assert!(log.quota > 0);

        // Exactly one decrement: the user's used quota equals the log row.
        let user = store::users::get(user_id).unwrap().unwrap();
        assert_eq!(user.used_quota, log.quota);

        // Trace carries the canonical milestones and pairs the log.
        let trace = store::traces::get_by_log(log.id).unwrap().unwrap();
        assert!(trace.received_at.is_some());
        assert!(trace.forwarded_at.is_some());
        assert!(trace.first_upstream_at.is_some());
        assert!(trace.completed_at.is_some());
        assert_eq!(trace.status, Some(200));
    }

    #[tokio::test]
    async fn upstream_5xx_retries_on_second_channel_and_suspends_first() {
        let key = {
            let _guard = testutil::setup();
            let (_, key) = seed_identity(1_000_000);
            key
        };
        let bad_upstream = spawn_mock(mock_unavailable()).await;
        let good_upstream = spawn_mock(mock_chat_completion()).await;
        let (bad_channel, _good_channel) = {
            let _guard = testutil::setup();
            // Higher priority loses first, proving the failover re-picks.
            let bad = seed_channel("s4-model", &bad_upstream, 10);
            let good = seed_channel("s4-model", &good_upstream, 0);
            (bad, good)
        };
        let gateway = spawn_app().await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/chat/completions", gateway))
            .bearer_auth(&key)
            .json(&json!({
                "model": "s4-model",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200, "client sees success");

        let _guard = testutil::setup();
        let until = store::abilities::suspended_until(
            bad_channel,
            "s4-model",
            "default",
            store::abilities::SuspendClass::ServerError,
        )
        .unwrap();
        let now = store::now_unix();
        assert!(
            until >= now + config::load().suspend_5xx_secs - 2,
            "failed ability is benched for the 5xx window"
        );
    }

    #[tokio::test]
    async fn response_api_falls_back_through_chat() {
        let key = {
            let _guard = testutil::setup();
            let (_, key) = seed_identity(1_000_000);
            key
        };
        let upstream = spawn_mock(mock_chat_completion()).await;
        {
            let _guard = testutil::setup();
            seed_channel("s6-model", &upstream, 0);
        }
        let gateway = spawn_app().await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/responses", gateway))
            .bearer_auth(&key)
            .json(&json!({ "model": "s6-model", "input": "ping" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["object"], "response");
        assert_eq!(body["output"][0]["content"][0]["text"], "pong");
        assert_eq!(body["usage"]["input_tokens"], 8);

        let _guard = testutil::setup();
        let log = store::logs::recent(50, 0)
            .unwrap()
            .into_iter()
            .find(|l| l.model == "s6-model")
            .expect("usage log row");
        // The log records the model exactly as requested.
        assert_eq!(log.model, "s6-model");
    }

    #[tokio::test]
    async fn insufficient_quota_is_rejected_before_upstream() {
        let key = {
            let _guard = testutil::setup();
            let (_, key) = seed_identity(10);
            key
        };
        let upstream = spawn_mock(mock_chat_completion()).await;
        {
            let _guard = testutil::setup();
            seed_channel("s-poor-model", &upstream, 0);
        }
        let gateway = spawn_app().await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/v1/chat/completions", gateway))
            .bearer_auth(&key)
            .json(&json!({
                "model": "s-poor-model",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 402);
        let body = response.json::<Value>().await.unwrap();
        assert_eq!(body["error"]["type"], "insufficient_quota");
    }
}
