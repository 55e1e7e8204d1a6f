//! Relay error taxonomy
//!
//! Typed errors for the relay path. The controller wraps everything into
//! the client envelope `{error: {message, type, code}}` at the boundary;
//! errors that imply channel unhealth carry an outcome tag the scheduler
//! and the health monitor consume.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Failure classification fed back to the scheduler and monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    ServerError,
    Auth,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionCategory {
    UnsupportedParameter,
    InvalidSchema,
    TruncatedStream,
}

impl ConversionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionCategory::UnsupportedParameter => "unsupported_parameter",
            ConversionCategory::InvalidSchema => "invalid_schema",
            ConversionCategory::TruncatedStream => "truncated_stream",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelayError {
    /// Malformed body, unknown model, bad parameters.
    InvalidRequest(String),
    /// Bad, expired or revoked credentials (client- or upstream-origin).
    Authentication(String),
    /// Valid credentials without access to the resource.
    Permission(String),
    NotFound(String),
    /// Pre-consumption or mid-stream quota exhaustion.
    InsufficientQuota(String),
    /// Ingress or channel bucket exhausted; includes `no_available_channel`.
    RateLimited(String),
    /// 5xx from the provider.
    UpstreamError(String),
    /// Relay or idle timeout tripped.
    UpstreamTimeout(String),
    Conversion(ConversionCategory, String),
    Internal(String),
}

impl RelayError {
    pub fn outcome(&self) -> Outcome {
        match self {
            RelayError::RateLimited(_) => Outcome::RateLimited,
            RelayError::UpstreamError(_) | RelayError::UpstreamTimeout(_) => Outcome::ServerError,
            RelayError::Authentication(_) => Outcome::Auth,
            _ => Outcome::Other,
        }
    }

    /// Whether the controller may transparently pick another channel.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamError(_)
                | RelayError::UpstreamTimeout(_)
                | RelayError::RateLimited(_)
        )
    }

    fn parts(&self) -> (StatusCode, &'static str, &'static str, &str) {
        match self {
            RelayError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "invalid_request_error",
                msg,
            ),
            RelayError::Authentication(msg) => (
                StatusCode::UNAUTHORIZED,
                "authentication",
                "invalid_api_key",
                msg,
            ),
            RelayError::Permission(msg) => {
                (StatusCode::FORBIDDEN, "permission", "permission_denied", msg)
            }
            RelayError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", "not_found", msg),
            RelayError::InsufficientQuota(msg) => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_quota",
                "insufficient_quota",
                msg,
            ),
            RelayError::RateLimited(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate_limit_exceeded",
                msg,
            ),
            RelayError::UpstreamError(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", "bad_gateway", msg)
            }
            RelayError::UpstreamTimeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                "timeout",
                msg,
            ),
            RelayError::Conversion(category, msg) => {
                let status = match category {
                    ConversionCategory::UnsupportedParameter => StatusCode::BAD_REQUEST,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, "conversion_error", category.as_str(), msg)
            }
            RelayError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal_error",
                msg,
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    pub fn envelope(&self) -> serde_json::Value {
        let (_, error_type, code, message) = self.parts();
        serde_json::json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": code
            }
        })
    }

    /// Terminal SSE frame carrying the error envelope, emitted before the
    /// stream closes.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.envelope())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (_, error_type, _, message) = self.parts();
        write!(f, "{}: {}", error_type, message)
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, error_type, _, message) = self.parts();
        crate::logger::error(
            "relay",
            &format!(
                "Returning error response: status={}, type={}, message={}",
                status.as_u16(),
                error_type,
                message
            ),
        );
        (status, Json(self.envelope())).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            RelayError::InsufficientQuota(String::new()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            RelayError::UpstreamError(String::new()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::UpstreamTimeout(String::new()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::Conversion(ConversionCategory::UnsupportedParameter, String::new())
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Conversion(ConversionCategory::InvalidSchema, String::new()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn outcome_tags() {
        assert_eq!(
            RelayError::RateLimited(String::new()).outcome(),
            Outcome::RateLimited
        );
        assert_eq!(
            RelayError::UpstreamError(String::new()).outcome(),
            Outcome::ServerError
        );
        assert_eq!(
            RelayError::Authentication(String::new()).outcome(),
            Outcome::Auth
        );
        assert_eq!(
            RelayError::InvalidRequest(String::new()).outcome(),
            Outcome::Other
        );
    }

    #[test]
    fn envelope_shape() {
        let err = RelayError::RateLimited("slow down".to_string());
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["type"], "rate_limited");
        assert_eq!(envelope["error"]["message"], "slow down");
        assert!(err.to_sse_frame().starts_with("data: "));
        assert!(err.to_sse_frame().ends_with("\n\n"));
    }
}
