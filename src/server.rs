//! HTTP server
//!
//! Router assembly and lifecycle. Relay ingress routes live under `/v1`,
//! operational surfaces under `/api`. Shutdown drains in-flight requests
//! for the configured grace period.

use axum::{
    extract::Query,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::{config, logger, relay, store};

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn recent_logs(Query(q): Query<LogsQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let offset = q.offset.unwrap_or(0).max(0);
    match (store::logs::recent(limit, offset), store::logs::count()) {
        (Ok(logs), Ok(total)) => Json(json!({
            "logs": logs,
            "total": total,
            "limit": limit,
            "offset": offset
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct SysLogsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    level: Option<String>,
    source: Option<String>,
}

async fn system_logs(Query(q): Query<SysLogsQuery>) -> Json<Value> {
    let query = logger::LogQuery {
        limit: q.limit,
        offset: q.offset,
        level: q.level.as_deref().and_then(logger::LogLevel::from_str),
        source: q.source,
        start_time: None,
        end_time: None,
    };
    let logs = logger::query_logs(&query);
    let total = logger::logs_count(&query);
    Json(json!({ "logs": logs, "total": total }))
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(health))
        // ============================================
        // Relay ingress (the three dialects + modalities)
        // ============================================
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/messages", post(relay::claude_messages))
        .route("/v1/responses", post(relay::responses))
        .route("/v1/embeddings", post(relay::embeddings))
        .route("/v1/images/generations", post(relay::images_generations))
        .route("/v1/images/edits", post(relay::images_edits))
        .route("/v1/audio/speech", post(relay::audio_speech))
        .route("/v1/audio/transcriptions", post(relay::audio_transcriptions))
        .route("/v1/models", get(relay::list_models))
        // ============================================
        // Operational surfaces
        // ============================================
        .route("/api/models/display", get(relay::models_display))
        .route("/api/status/channel", get(relay::channel_status))
        .route("/api/trace/log/:id", get(relay::trace_detail))
        .route("/api/logs", get(recent_logs))
        .route("/api/system-logs", get(system_logs))
        .layer(cors)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    logger::info("server", "Shutdown signal received, draining");
}

pub async fn serve() {
    let cfg = config::load();
    let app = app();
    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            logger::error("server", &format!("Failed to bind {}: {}", addr, e));
            return;
        }
    };
    logger::info("server", &format!("Listening on {}", addr));

    let drain_secs = cfg.shutdown_timeout_secs;
    let shutdown = async move {
        shutdown_signal().await;
        // In-flight requests get the grace period, then the process goes.
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(drain_secs)).await;
            logger::warn("server", "Drain deadline exceeded, exiting");
            std::process::exit(0);
        });
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        logger::error("server", &format!("Server error: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_ok() {
        let _guard = crate::testutil::setup();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        let url = format!("http://{}", addr);
        let r = reqwest::get(format!("{}/health", url)).await.unwrap();
        let s = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(s["status"], "ok");
        drop(h);
    }

    #[tokio::test]
    async fn relay_rejects_missing_key() {
        let _guard = crate::testutil::setup();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });

        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{}/v1/chat/completions", addr))
            .json(&json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 401);
        let body = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication");
        drop(h);
    }
}
