use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::http::build_client;
use crate::idempotency::{redis_get, redis_set};
use crate::partner::config::{PARTNER_API_URL, PARTNER_EMAIL, PARTNER_PASSWORD};

/// Tokens are treated as expired this many seconds early so an in-flight
/// request never carries one that lapses mid-call.
const EXPIRY_SKEW_SECS: i64 = 60;
const FALLBACK_TTL_SECS: i64 = 3600;
const TOKEN_CACHE_KEY: &str = "caravel:partner:token";

#[derive(Debug, Error)]
pub enum PartnerAuthError {
    #[error("missing partner credentials in env")]
    MissingCredentials,
    #[error("auth request failed: {0}")]
    Request(String),
    #[error("partner rejected the credentials: HTTP {0}")]
    Denied(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_SKEW_SECS > now
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
    #[serde(default)]
    exp: Option<i64>,
}

/// Hands out a valid fulfillment-partner JWT, refreshing through
/// `POST /auth` only when the cached one is stale. The token is cached in
/// process and, when Redis is around, shared across instances.
pub struct AuthTokenProvider {
    client: Client,
    base_url: String,
    email: String,
    password: String,
    redis: Option<redis::Client>,
    local: Mutex<Option<CachedToken>>,
}

impl AuthTokenProvider {
    /// `None` when `PARTNER_API_URL` / `PARTNER_EMAIL` / `PARTNER_PASSWORD`
    /// are unset; order forwarding is then reported as not configured.
    pub fn from_env(redis: Option<redis::Client>) -> Option<Self> {
        let base_url = PARTNER_API_URL.trim();
        let email = PARTNER_EMAIL.trim();
        let password = PARTNER_PASSWORD.trim();
        if base_url.is_empty() || email.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self::with_base_url(email, password, base_url, redis))
    }

    pub fn with_base_url(
        email: impl Into<String>,
        password: impl Into<String>,
        base_url: &str,
        redis: Option<redis::Client>,
    ) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.into(),
            password: password.into(),
            redis,
            local: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// A token valid for at least [`EXPIRY_SKEW_SECS`] more seconds, from
    /// cache when possible.
    pub async fn get_token(&self) -> Result<String, PartnerAuthError> {
        let now = Utc::now().timestamp();
        {
            let guard = self.local.lock().await;
            if let Some(cached) = guard.as_ref()
                && cached.is_fresh(now)
            {
                return Ok(cached.token.clone());
            }
        }
        if let Some(redis) = &self.redis
            && let Some(cached) = redis_get::<CachedToken>(redis, TOKEN_CACHE_KEY).await
            && cached.is_fresh(now)
        {
            let token = cached.token.clone();
            let mut guard = self.local.lock().await;
            *guard = Some(cached);
            return Ok(token);
        }
        self.refresh(now).await
    }

    /// Drops whatever is cached and authenticates again. For the one case
    /// where the partner 401s a token we still believed in.
    pub async fn force_refresh(&self) -> Result<String, PartnerAuthError> {
        {
            let mut guard = self.local.lock().await;
            *guard = None;
        }
        self.refresh(Utc::now().timestamp()).await
    }

    async fn refresh(&self, now: i64) -> Result<String, PartnerAuthError> {
        let url = format!("{}/auth", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "email": self.email,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|err| PartnerAuthError::Request(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PartnerAuthError::Denied(status.as_u16()));
        }
        if !status.is_success() {
            return Err(PartnerAuthError::Request(format!("HTTP {status}")));
        }
        let payload: AuthResponse = response
            .json()
            .await
            .map_err(|err| PartnerAuthError::Request(err.to_string()))?;

        let expires_at = payload
            .exp
            .or_else(|| jwt_expiry(&payload.token))
            .unwrap_or(now + FALLBACK_TTL_SECS);
        let cached = CachedToken {
            token: payload.token,
            expires_at,
        };
        debug!(target = "caravel.partner", expires_at, "partner token refreshed");

        if let Some(redis) = &self.redis {
            let ttl = (expires_at - now).max(EXPIRY_SKEW_SECS) as usize;
            redis_set(redis, TOKEN_CACHE_KEY, &cached, ttl).await;
        }
        let token = cached.token.clone();
        let mut guard = self.local.lock().await;
        *guard = Some(cached);
        Ok(token)
    }
}

/// Reads the `exp` claim out of a JWT without verifying anything; expiry
/// is a caching hint here, not a trust decision.
fn jwt_expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let claims = parts.next()?;
    let decoded = URL_SAFE_NO_PAD.decode(claims).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    value.get("exp")?.as_i64()
}
