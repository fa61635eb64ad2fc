use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::auth::AccessTokenCache;
use crate::config::{QqConfig, WorkerConfig};

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

/// Connection quota for new gateway sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    #[serde(default)]
    pub total: i64,
    pub remaining: i64,
    /// Milliseconds until `remaining` resets.
    #[serde(default)]
    pub reset_after: u64,
    #[serde(default)]
    pub max_concurrency: u32,
}

fn default_shards() -> u32 {
    1
}

/// Client for the destination platform's bot OpenAPI.
pub struct QqApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<AccessTokenCache>,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl QqApi {
    pub fn new(config: &QqConfig, worker: &WorkerConfig, tokens: Arc<AccessTokenCache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_base().to_string(),
            tokens,
            request_timeout: worker.request_timeout(),
            upload_timeout: worker.upload_timeout(),
        }
    }

    pub fn tokens(&self) -> &Arc<AccessTokenCache> {
        &self.tokens
    }

    /// Post a text message. Non-2xx answers are returned, not raised;
    /// only transport failures are errors.
    pub async fn send_text(&self, channel_id: &str, content: &str) -> Result<ApiResponse> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        debug!("Sending text message to channel {}", channel_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.tokens.auth_header(false).await?)
            .json(&serde_json::json!({ "content": content }))
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send text message")?;

        read_response(response).await
    }

    /// Post text plus an image as `multipart/form-data` (`content` + `file_image`).
    pub async fn send_with_image(
        &self,
        channel_id: &str,
        content: &str,
        image_path: &Path,
    ) -> Result<ApiResponse> {
        let bytes = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("Failed to read image: {}", image_path.display()))?;
        let file_name = image_path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("image.jpg")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new()
            .text("content", content.to_string())
            .part("file_image", part);

        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        debug!(
            "Sending image message to channel {} ({})",
            channel_id,
            image_path.display()
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.tokens.auth_header(false).await?)
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
            .context("Failed to send image message")?;

        read_response(response).await
    }

    /// Resolve the gateway URL and the session-start quota.
    pub async fn gateway_bot(&self) -> Result<GatewayBot> {
        let url = format!("{}/gateway/bot", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.tokens.auth_header(false).await?)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to call gateway discovery")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gateway discovery error ({}): {}", status, body);
        }

        let gateway: GatewayBot = response
            .json()
            .await
            .context("Failed to parse gateway discovery response")?;
        if gateway.url.trim().is_empty() {
            anyhow::bail!("Gateway discovery returned an empty url");
        }
        Ok(gateway)
    }

    /// Guilds the bot has joined.
    pub async fn guilds(&self) -> Result<Vec<Value>> {
        let data = self.get_json("/users/@me/guilds", "Guild list").await?;
        Ok(into_list(data))
    }

    /// Raw channel list of a guild.
    pub async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Value>> {
        let data = self
            .get_json(&format!("/guilds/{}/channels", guild_id), "Guild channel list")
            .await?;
        Ok(into_list(data))
    }

    async fn get_json(&self, path: &str, what: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.tokens.auth_header(false).await?)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", what))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} error ({}): {}", what, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {}", what))
    }

    /// Pick a channel to post into when only a guild is configured.
    /// Failures are logged and yield `None`.
    pub async fn resolve_default_channel(&self, guild_id: &str) -> Option<String> {
        match self.guild_channels(guild_id).await {
            Ok(channels) => {
                let picked = pick_default_channel(&channels);
                match &picked {
                    Some(id) => info!("Picked channel {} from guild {}", id, guild_id),
                    None => error!("No usable channel found in guild {}", guild_id),
                }
                picked
            }
            Err(e) => {
                error!("Failed to resolve channel for guild {}: {:#}", guild_id, e);
                None
            }
        }
    }
}

// Some deployments wrap lists in an object.
fn into_list(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Object(mut obj) => ["data", "channels", "guilds", "items"]
            .iter()
            .find_map(|k| match obj.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

async fn read_response(response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .context("Failed to read response body")?;
    Ok(ApiResponse { status, body })
}

// Text channel types, most preferred first.
const PREFERRED_CHANNEL_TYPES: [i64; 3] = [0, 10007, 10011];
// Category nodes cannot receive messages.
const CATEGORY_CHANNEL_TYPE: i64 = 4;

/// Choose a channel id from a guild's channel list:
/// 1. a speakable channel of a preferred type (in preference order),
/// 2. any channel of a preferred type,
/// 3. any speakable non-category channel,
/// 4. the first channel that has an id.
pub fn pick_default_channel(channels: &[Value]) -> Option<String> {
    let id_of = |ch: &Value| -> Option<String> {
        match ch.get("id").or_else(|| ch.get("channel_id"))? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };
    let type_of = |ch: &Value| -> Option<i64> {
        match ch.get("type")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    };
    let can_speak = |ch: &Value| -> bool {
        match ch.get("speak_permission") {
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            Some(Value::String(s)) => s == "1",
            _ => false,
        }
    };
    let candidates: Vec<&Value> = channels
        .iter()
        .filter(|ch| ch.is_object() && type_of(ch) != Some(CATEGORY_CHANNEL_TYPE))
        .collect();

    for wanted in PREFERRED_CHANNEL_TYPES {
        if let Some(id) = candidates
            .iter()
            .filter(|ch| type_of(ch) == Some(wanted) && can_speak(ch))
            .find_map(|ch| id_of(ch))
        {
            return Some(id);
        }
    }
    for wanted in PREFERRED_CHANNEL_TYPES {
        if let Some(id) = candidates
            .iter()
            .filter(|ch| type_of(ch) == Some(wanted))
            .find_map(|ch| id_of(ch))
        {
            return Some(id);
        }
    }
    if let Some(id) = candidates
        .iter()
        .filter(|ch| can_speak(ch))
        .find_map(|ch| id_of(ch))
    {
        return Some(id);
    }
    channels.iter().find_map(id_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(server: &mockito::Server) -> QqApi {
        let qq = QqConfig {
            api_base: format!("{}/", server.url()),
            access_token: "tok".to_string(),
            ..Default::default()
        };
        let tokens = Arc::new(AccessTokenCache::new(&qq, Duration::from_secs(5)));
        QqApi::new(&qq, &WorkerConfig::default(), tokens)
    }

    #[tokio::test]
    async fn test_send_text_posts_json_with_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/channels/634/messages")
            .match_header("authorization", "QQBot tok")
            .match_body(mockito::Matcher::Json(json!({ "content": "hello" })))
            .with_status(200)
            .with_body(r#"{"id":"m1"}"#)
            .create_async()
            .await;

        let response = api(&server).send_text("634", "hello").await.unwrap();
        assert!(response.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_text_returns_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/channels/634/messages")
            .with_status(401)
            .with_body(r#"{"code":11244,"message":"token not exist"}"#)
            .create_async()
            .await;

        let response = api(&server).send_text("634", "hello").await.unwrap();
        assert_eq!(response.status, 401);
        assert!(response.body.contains("token not exist"));
    }

    #[tokio::test]
    async fn test_send_with_image_is_multipart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/channels/634/messages")
            .match_header(
                "content-type",
                mockito::Matcher::Regex("^multipart/form-data".to_string()),
            )
            .match_body(mockito::Matcher::Regex("name=\"file_image\"".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"fake jpeg bytes").unwrap();

        let response = api(&server)
            .send_with_image("634", "caption", &path)
            .await
            .unwrap();
        assert!(response.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_with_missing_image_is_error() {
        let server = mockito::Server::new_async().await;
        let result = api(&server)
            .send_with_image("634", "caption", Path::new("/nonexistent/x.jpg"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gateway_bot() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gateway/bot")
            .with_status(200)
            .with_body(
                json!({
                    "url": "wss://api.sgroup.qq.com/websocket",
                    "shards": 1,
                    "session_start_limit": {
                        "total": 1000, "remaining": 998, "reset_after": 86400000, "max_concurrency": 1
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway = api(&server).gateway_bot().await.unwrap();
        assert_eq!(gateway.url, "wss://api.sgroup.qq.com/websocket");
        assert_eq!(gateway.session_start_limit.unwrap().remaining, 998);
    }

    #[tokio::test]
    async fn test_resolve_default_channel_from_wrapped_list() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/guilds/g1/channels")
            .with_status(200)
            .with_body(
                json!({ "data": [
                    { "id": "1", "type": 4 },
                    { "id": "2", "type": 10007, "speak_permission": 1 }
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        assert_eq!(
            api(&server).resolve_default_channel("g1").await.as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_guilds() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/users/@me/guilds")
            .match_header("authorization", "QQBot tok")
            .with_status(200)
            .with_body(json!([{ "id": "g1", "name": "影视" }]).to_string())
            .create_async()
            .await;

        let guilds = api(&server).guilds().await.unwrap();
        assert_eq!(guilds.len(), 1);
        assert_eq!(guilds[0]["id"], "g1");
    }

    #[tokio::test]
    async fn test_guild_channels_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/guilds/g1/channels")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let err = api(&server).guild_channels("g1").await.unwrap_err();
        assert!(err.to_string().contains("403"));
        assert!(api(&server).resolve_default_channel("g1").await.is_none());
    }

    #[test]
    fn test_pick_prefers_speakable_text_channel() {
        let channels = vec![
            json!({ "id": "cat", "type": 4, "speak_permission": 1 }),
            json!({ "id": "voice", "type": 2, "speak_permission": 1 }),
            json!({ "id": "forum", "type": 10007 }),
            json!({ "id": "text", "type": 0, "speak_permission": 1 }),
        ];
        assert_eq!(pick_default_channel(&channels).as_deref(), Some("text"));
    }

    #[test]
    fn test_pick_fallback_order() {
        // No speakable preferred channel: first preferred type wins.
        let channels = vec![
            json!({ "id": "voice", "type": 2, "speak_permission": 1 }),
            json!({ "id": "app", "type": 10011 }),
            json!({ "id": "forum", "type": 10007 }),
        ];
        assert_eq!(pick_default_channel(&channels).as_deref(), Some("forum"));

        // No preferred type at all: any speakable channel.
        let channels = vec![
            json!({ "id": "x", "type": 2 }),
            json!({ "id": "voice", "type": 2, "speak_permission": 1 }),
        ];
        assert_eq!(pick_default_channel(&channels).as_deref(), Some("voice"));

        // Nothing speakable: first channel with an id, categories included.
        let channels = vec![json!({ "type": 2 }), json!({ "channel_id": 77, "type": 4 })];
        assert_eq!(pick_default_channel(&channels).as_deref(), Some("77"));

        assert!(pick_default_channel(&[]).is_none());
    }
}
