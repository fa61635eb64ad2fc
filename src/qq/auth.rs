use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::QqConfig;

#[derive(Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "appId")]
    app_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    // The platform sends this as a string; accept a number as well.
    #[serde(default)]
    expires_in: serde_json::Value,
}

#[derive(Default)]
struct CachedToken {
    value: Option<String>,
    expires_at: Option<Instant>,
    last_error: Option<String>,
    last_refresh_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Snapshot for logs; never contains the credential itself.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub has_manual_token: bool,
    pub has_cached_token: bool,
    pub expires_in_secs: u64,
    pub last_refresh_at: Option<String>,
    pub last_refresh_error: Option<String>,
}

/// Access token cache for the bot OpenAPI.
///
/// A manually configured token is returned as is. Otherwise the token is
/// fetched from the app-token endpoint and refreshed `refresh_skew` before it
/// expires, or whenever a caller forces it.
pub struct AccessTokenCache {
    client: reqwest::Client,
    token_url: String,
    app_id: String,
    app_secret: String,
    manual_token: Option<String>,
    scheme: String,
    refresh_skew: Duration,
    timeout: Duration,
    state: Mutex<CachedToken>,
}

impl AccessTokenCache {
    pub fn new(config: &QqConfig, timeout: Duration) -> Self {
        let manual = config.access_token.trim();
        if !manual.is_empty() {
            info!("Using manually configured access token (refresh disabled)");
        }
        Self {
            client: reqwest::Client::new(),
            token_url: config.token_url.clone(),
            app_id: config.app_id.trim().to_string(),
            app_secret: config.app_secret.trim().to_string(),
            manual_token: (!manual.is_empty()).then(|| manual.to_string()),
            scheme: config.auth_scheme.clone(),
            refresh_skew: Duration::from_secs(config.refresh_skew_secs),
            timeout,
            state: Mutex::new(CachedToken::default()),
        }
    }

    /// Return a usable token, fetching a new one when the cached one is
    /// missing, close to expiry, or `force_refresh` is set.
    ///
    /// If the fetch fails but an older token is cached, the older token is
    /// returned and the error is kept for [`status`](Self::status).
    pub async fn get_token(&self, force_refresh: bool) -> Result<String> {
        if let Some(ref token) = self.manual_token {
            return Ok(token.clone());
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();

        if !force_refresh {
            if let (Some(value), Some(expires_at)) = (&state.value, state.expires_at) {
                if now + self.refresh_skew < expires_at {
                    return Ok(value.clone());
                }
            }
        }

        match self.fetch().await {
            Ok((token, expires_in)) => {
                info!("Access token refreshed, expires in {}s", expires_in.as_secs());
                state.value = Some(token.clone());
                state.expires_at = Some(now + expires_in);
                state.last_error = None;
                state.last_refresh_at = Some(chrono::Utc::now());
                Ok(token)
            }
            Err(e) => {
                state.last_error = Some(format!("{:#}", e));
                match &state.value {
                    Some(stale) => {
                        warn!("Access token refresh failed, keeping cached token: {:#}", e);
                        Ok(stale.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// `Authorization` header value, e.g. `QQBot <token>`.
    pub async fn auth_header(&self, force_refresh: bool) -> Result<String> {
        let token = self.get_token(force_refresh).await?;
        Ok(format!("{} {}", self.scheme, token))
    }

    pub async fn status(&self) -> TokenStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        TokenStatus {
            has_manual_token: self.manual_token.is_some(),
            has_cached_token: state.value.is_some(),
            expires_in_secs: state
                .expires_at
                .map(|at| at.saturating_duration_since(now).as_secs())
                .unwrap_or(0),
            last_refresh_at: state.last_refresh_at.map(|t| t.to_rfc3339()),
            last_refresh_error: state.last_error.clone(),
        }
    }

    async fn fetch(&self) -> Result<(String, Duration)> {
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            anyhow::bail!("app_id and app_secret are required to refresh the access token");
        }

        let response = self
            .client
            .post(&self.token_url)
            .json(&TokenRequest {
                app_id: &self.app_id,
                client_secret: &self.app_secret,
            })
            .timeout(self.timeout)
            .send()
            .await
            .context("Failed to call access token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Access token endpoint error ({}): {}", status, body);
        }

        let body: TokenResponse = response
            .json()
            .await
            .context("Failed to parse access token response")?;

        let token = body.access_token.trim().to_string();
        let expires_in = match &body.expires_in {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
            serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };
        if token.is_empty() || expires_in == 0 {
            anyhow::bail!("Invalid access token response (token or expires_in missing)");
        }
        Ok((token, Duration::from_secs(expires_in)))
    }
}
