//! Ingress authentication
//!
//! Bearer-token parsing and validation. A key suffix of `-<channelId>`
//! pins the request to one channel; only admin-owned tokens may use it.

use axum::http::HeaderMap;

use crate::store::{self, tokens::Token, users::User};

use super::error::{RelayError, RelayResult};

/// Extract the credential from the request headers.
///
/// `Authorization: Bearer` is canonical; `x-api-key` is accepted for
/// Claude-style clients.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let key = auth.trim().to_string();
        if !key.is_empty() {
            return Some(key);
        }
    }

    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Split a possible `-<channelId>` pin suffix off the key.
pub fn split_channel_pin(raw: &str) -> (String, Option<i64>) {
    if let Some((head, tail)) = raw.rsplit_once('-') {
        if head.starts_with(store::tokens::KEY_PREFIX) && !tail.is_empty() {
            if let Ok(channel_id) = tail.parse::<i64>() {
                return (head.to_string(), Some(channel_id));
            }
        }
    }
    (raw.to_string(), None)
}

pub struct AuthedRequest {
    pub token: Token,
    pub user: User,
    pub pinned_channel: Option<i64>,
}

/// Validate the credential and resolve the owning user.
pub fn authenticate(headers: &HeaderMap) -> RelayResult<AuthedRequest> {
    let raw = extract_key(headers)
        .ok_or_else(|| RelayError::Authentication("Missing API key".to_string()))?;
    let (key, pin) = split_channel_pin(&raw);

    let token = store::tokens::get_by_key(&key)
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .ok_or_else(|| RelayError::Authentication("Invalid API key".to_string()))?;

    if token.status != store::tokens::STATUS_ENABLED {
        return Err(RelayError::Authentication("Token is disabled".to_string()));
    }
    if let Some(expires_at) = token.expires_at {
        if expires_at > 0 && expires_at < store::now_unix() {
            let _ = store::tokens::set_status(token.id, store::tokens::STATUS_EXPIRED);
            return Err(RelayError::Authentication("Token has expired".to_string()));
        }
    }

    let user = store::users::get(token.user_id)
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .ok_or_else(|| RelayError::Authentication("Token owner not found".to_string()))?;
    if user.status != store::users::STATUS_ENABLED {
        return Err(RelayError::Authentication("User is disabled".to_string()));
    }

    // A pin on the token row is available to anyone who holds the token;
    // the key-suffix form is an admin affordance.
    let pinned_channel = match pin {
        Some(channel_id) => {
            if !user.is_admin() {
                return Err(RelayError::Permission(
                    "Channel pinning requires an admin token".to_string(),
                ));
            }
            Some(channel_id)
        }
        None => token.channel_pin,
    };

    Ok(AuthedRequest {
        token,
        user,
        pinned_channel,
    })
}

/// Model allow-list check for the token; empty list inherits the group.
pub fn check_model_allowed(token: &Token, model: &str) -> RelayResult<()> {
    if token.allows_model(model) {
        Ok(())
    } else {
        Err(RelayError::Permission(format!(
            "Model '{}' is not allowed for this token",
            model
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_suffix_parsing() {
        let (key, pin) = split_channel_pin("sk-abc123-42");
        assert_eq!(key, "sk-abc123");
        assert_eq!(pin, Some(42));

        let (key, pin) = split_channel_pin("sk-abc123");
        assert_eq!(key, "sk-abc123");
        assert_eq!(pin, None);

        // Non-numeric suffixes are part of the key.
        let (key, pin) = split_channel_pin("sk-abc-def");
        assert_eq!(key, "sk-abc-def");
        assert_eq!(pin, None);
    }

    #[test]
    fn bearer_takes_precedence_over_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-one".parse().unwrap());
        headers.insert("x-api-key", "sk-two".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("sk-one".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-two".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("sk-two".to_string()));
    }
}
