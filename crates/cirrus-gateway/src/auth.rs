//! API-key authentication.
//!
//! Keys are minted through `/api/auth/api-key`, carried as a bearer token,
//! and checked by a router-level middleware on the protected surfaces. The
//! agent-facing endpoints (`/api/results`, `/api/vms/register`) stay open:
//! VMs do not hold keys.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use crate::AppState;

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub user_id: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ApiKeyManager {
    keys: DashMap<String, ApiKey>,
}

impl ApiKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, user_id: &str, roles: Vec<String>, expires_in: Duration) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        let key = base64::engine::general_purpose::STANDARD.encode(bytes);

        let now = Utc::now();
        self.keys.insert(
            key.clone(),
            ApiKey {
                user_id: user_id.to_string(),
                roles,
                created_at: now,
                expires_at: now
                    + chrono::Duration::from_std(expires_in)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            },
        );
        key
    }

    /// True if the key exists and has not expired. Expired keys are dropped
    /// on the way out.
    pub fn validate(&self, key: &str) -> bool {
        let Some(entry) = self.keys.get(key) else {
            return false;
        };
        if Utc::now() > entry.expires_at {
            drop(entry);
            self.keys.remove(key);
            return false;
        }
        true
    }
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match key {
        Some(key) if state.auth.validate(key) => next.run(request).await,
        _ => {
            debug!(path = %request.uri().path(), "Rejected request without valid API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "invalid or missing API key"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_validates() {
        let manager = ApiKeyManager::new();
        let key = manager.generate("u1", vec!["user".to_string()], Duration::from_secs(60));
        assert!(manager.validate(&key));
        assert!(!manager.validate("not-a-key"));
    }

    #[test]
    fn test_expired_key_is_rejected_and_purged() {
        let manager = ApiKeyManager::new();
        let key = manager.generate("u1", vec![], Duration::ZERO);
        assert!(!manager.validate(&key));
        assert!(manager.keys.get(&key).is_none());
    }
}
