//! Trace recorder
//!
//! Records the six canonical milestones of a relay request. Timestamps are
//! UTC milliseconds; writes are best-effort because a lost trace must never
//! fail the request it describes.

use serde_json::{json, Value};

use crate::store::traces::{self, Milestone, TraceRecord};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct TraceRecorder {
    trace_id: String,
}

impl TraceRecorder {
    /// Create the trace row with the `received` milestone set.
    pub fn start(trace_id: &str, url: &str, method: &str, body_size: i64) -> Self {
        if let Err(e) = traces::create(trace_id, url, method, body_size, now_millis()) {
            crate::logger::error("trace", &format!("Failed to create trace row: {}", e));
        }
        Self {
            trace_id: trace_id.to_string(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn record(&self, milestone: Milestone) {
        let _ = traces::set_milestone(&self.trace_id, milestone, now_millis());
    }

    pub fn record_status(&self, status: u16) {
        let _ = traces::set_status(&self.trace_id, status as i64);
    }

    /// Final milestone; pairs the billing log row when one was written.
    pub fn record_end(&self, log_id: Option<i64>) {
        let _ = traces::set_milestone(&self.trace_id, Milestone::Completed, now_millis());
        if let Some(log_id) = log_id {
            let _ = traces::pair_log(&self.trace_id, log_id);
        }
    }
}

/// Render a trace with derived durations for the inspection endpoint.
/// Negative spans from clock skew clamp to zero.
pub fn render(record: &TraceRecord) -> Value {
    json!({
        "trace_id": record.trace_id,
        "log_id": record.log_id,
        "url": record.url,
        "method": record.method,
        "body_size": record.body_size,
        "status": record.status,
        "timestamps": {
            "received": record.received_at,
            "forwarded": record.forwarded_at,
            "first_upstream_response": record.first_upstream_at,
            "first_client_response": record.first_client_at,
            "upstream_completed": record.upstream_done_at,
            "completed": record.completed_at,
        },
        "durations_ms": {
            "queueing": TraceRecord::span_ms(record.received_at, record.forwarded_at),
            "upstream_first_byte": TraceRecord::span_ms(record.forwarded_at, record.first_upstream_at),
            "client_first_byte": TraceRecord::span_ms(record.received_at, record.first_client_at),
            "upstream_total": TraceRecord::span_ms(record.forwarded_at, record.upstream_done_at),
            "total": TraceRecord::span_ms(record.received_at, record.completed_at),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn missing_milestones_render_as_null() {
        let _guard = testutil::setup();
        let recorder = TraceRecorder::start("tr-render-test", "/v1/chat/completions", "POST", 42);
        recorder.record(Milestone::Forwarded);
        recorder.record_status(200);
        recorder.record_end(None);

        let record = crate::store::traces::get("tr-render-test").unwrap().unwrap();
        let rendered = render(&record);
        assert_eq!(rendered["status"], 200);
        assert!(rendered["durations_ms"]["queueing"].is_number());
        // Never forwarded a first upstream byte: span stays null.
        assert!(rendered["durations_ms"]["upstream_first_byte"].is_null());
        assert!(rendered["durations_ms"]["total"].is_number());
    }
}
