use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::FilterRule;
use crate::task::Template;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub qq: QqConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-source forwarding rules, keyed by `source_id`.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Sources whose messages are always dropped, whatever `sources` says.
    #[serde(default)]
    pub blacklist: Vec<i64>,
}

/// Destination platform (QQ bot OpenAPI) settings.
#[derive(Debug, Deserialize, Clone)]
pub struct QqConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Manually supplied credential; disables refreshing when set.
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default)]
    pub target_channel_id: Option<String>,
    /// Used to pick a channel automatically when no channel id is configured.
    #[serde(default)]
    pub target_guild_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_sleep_secs")]
    pub circuit_breaker_sleep_secs: u64,
    #[serde(default = "default_quota_safety_margin_secs")]
    pub quota_safety_margin_secs: u64,
    #[serde(default = "default_quota_warn_remaining")]
    pub quota_warn_remaining: i64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_replacement_host")]
    pub replacement_host: String,
    #[serde(default = "default_suffix_note")]
    pub suffix_note: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub source_id: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub target_channel_id: Option<String>,
    #[serde(default = "default_gray_ratio")]
    pub gray_ratio: f64,
    #[serde(default)]
    pub filter: Option<FilterRule>,
    #[serde(default)]
    pub template: Template,
}

fn default_api_base() -> String {
    "https://api.sgroup.qq.com".to_string()
}

fn default_token_url() -> String {
    "https://bots.qq.com/app/getAppAccessToken".to_string()
}

fn default_refresh_skew_secs() -> u64 {
    60
}

fn default_auth_scheme() -> String {
    "QQBot".to_string()
}

fn default_send_interval_secs() -> f64 {
    1.5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_upload_timeout_secs() -> u64 {
    30
}

fn default_ready_timeout_secs() -> u64 {
    20
}

fn default_max_image_bytes() -> u64 {
    9 * 1024 * 1024
}

fn default_queue_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_intents() -> u64 {
    1 << 0
}

fn default_log_interval_secs() -> u64 {
    60
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_sleep_secs() -> u64 {
    300
}

fn default_quota_safety_margin_secs() -> u64 {
    5
}

fn default_quota_warn_remaining() -> i64 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_replacement_host() -> String {
    "www.zhuiju.us".to_string()
}

fn default_suffix_note() -> String {
    "访问搜影片名或进QQ群搜索".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tg2qq.db")
}

fn default_gray_ratio() -> f64 {
    1.0
}

impl Default for QqConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_url: default_token_url(),
            app_id: String::new(),
            app_secret: String::new(),
            access_token: String::new(),
            refresh_skew_secs: default_refresh_skew_secs(),
            auth_scheme: default_auth_scheme(),
            target_channel_id: None,
            target_guild_id: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            send_interval_secs: default_send_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            intents: default_intents(),
            log_interval_secs: default_log_interval_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_sleep_secs: default_circuit_breaker_sleep_secs(),
            quota_safety_margin_secs: default_quota_safety_margin_secs(),
            quota_warn_remaining: default_quota_warn_remaining(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            replacement_host: default_replacement_host(),
            suffix_note: default_suffix_note(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
        }
    }
}

impl QqConfig {
    pub fn api_base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }

    /// Statically configured destination channel, if any.
    pub fn static_channel_id(&self) -> Option<&str> {
        self.target_channel_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl WorkerConfig {
    /// Pause between task completions. Never below 200ms, whatever the config says.
    pub fn send_interval(&self) -> Duration {
        let secs = if self.send_interval_secs.is_finite() {
            self.send_interval_secs.max(0.2)
        } else {
            default_send_interval_secs()
        };
        Duration::from_secs_f64(secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms.max(50))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse TOML, then replace `${ENV_VAR}` placeholders inside string
    /// values with the environment variable's value (empty when unset).
    pub fn parse(content: &str) -> Result<Self> {
        Self::parse_with(content, |name| std::env::var(name).ok())
    }

    fn parse_with<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: toml::Value = toml::from_str(content)?;
        let placeholder = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
        resolve_env_vars(&mut value, &placeholder, &lookup);
        let config: Config = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let has_manual = !self.qq.access_token.trim().is_empty();
        let has_app = !self.qq.app_id.trim().is_empty() && !self.qq.app_secret.trim().is_empty();
        if !has_manual && !has_app {
            anyhow::bail!("[qq] needs either access_token or both app_id and app_secret");
        }
        Ok(())
    }

    pub fn source(&self, source_id: i64) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Substitutes placeholders in string values only; keys and TOML syntax are
/// never touched.
fn resolve_env_vars<F>(value: &mut toml::Value, placeholder: &Regex, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            if placeholder.is_match(s.as_str()) {
                *s = placeholder
                    .replace_all(s.as_str(), |caps: &Captures| lookup(&caps[1]).unwrap_or_default())
                    .into_owned();
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                resolve_env_vars(item, placeholder, lookup);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                resolve_env_vars(item, placeholder, lookup);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[qq]\naccess_token = \"manual\"\n").unwrap();
        assert_eq!(config.qq.api_base(), "https://api.sgroup.qq.com");
        assert_eq!(config.qq.auth_scheme, "QQBot");
        assert_eq!(config.worker.send_interval(), Duration::from_millis(1500));
        assert_eq!(config.worker.max_image_bytes, 9 * 1024 * 1024);
        assert_eq!(config.gateway.circuit_breaker_threshold, 5);
        assert_eq!(config.normalize.replacement_host, "www.zhuiju.us");
        assert!(config.sources.is_empty());
        assert!(config.qq.static_channel_id().is_none());
    }

    #[test]
    fn test_requires_credentials() {
        assert!(Config::parse("[qq]\napp_id = \"1\"\n").is_err());
        assert!(Config::parse("[qq]\napp_id = \"1\"\napp_secret = \"s\"\n").is_ok());
    }

    #[test]
    fn test_env_placeholders() {
        let toml = r#"
            [qq]
            app_id = "${APP_ID}"
            app_secret = "s-${SECRET}"
            target_channel_id = "${MISSING}"

            [[sources]]
            source_id = -100
            template = { prefix = "${PREFIX}", suffix = "" }
        "#;
        let config = Config::parse_with(toml, |name| match name {
            "APP_ID" => Some("1024".to_string()),
            "SECRET" => Some("xyz".to_string()),
            "PREFIX" => Some("[tg] ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.qq.app_id, "1024");
        assert_eq!(config.qq.app_secret, "s-xyz");
        assert_eq!(config.qq.target_channel_id.as_deref(), Some(""));
        assert_eq!(config.source(-100).unwrap().template.prefix, "[tg] ");
    }

    #[test]
    fn test_env_values_with_toml_metacharacters() {
        let toml = "[qq]\napp_id = \"${APP_ID}\"\napp_secret = \"${SECRET}\"\n";
        let config = Config::parse_with(toml, |name| match name {
            "APP_ID" => Some("1".to_string()),
            "SECRET" => Some(r#"ab\c"\nauth_scheme = "x"#.to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.qq.app_secret, r#"ab\c"\nauth_scheme = "x"#);
        assert_eq!(config.qq.auth_scheme, "QQBot");
    }

    #[test]
    fn test_sources_and_rules() {
        let toml = r#"
            blacklist = [-300]

            [qq]
            access_token = "t"
            target_channel_id = "  "

            [worker]
            send_interval_secs = 0.01

            [[sources]]
            source_id = -100
            gray_ratio = 50
            template = { prefix = "【{{channel_name}}】", suffix = "" }

            [sources.filter]
            block_keywords = ["spam"]
            require_allow = true
            allow_keywords = ["4K"]

            [[sources]]
            source_id = -200
            enabled = false
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.blacklist, vec![-300]);
        assert!(config.qq.static_channel_id().is_none());
        assert_eq!(config.worker.send_interval(), Duration::from_millis(200));

        let first = config.source(-100).unwrap();
        assert!(first.enabled);
        assert_eq!(first.gray_ratio, 50.0);
        assert_eq!(first.template.prefix, "【{{channel_name}}】");
        let rule = first.filter.as_ref().unwrap();
        assert_eq!(rule.block_keywords, vec!["spam"]);
        assert!(rule.require_allow);

        assert!(!config.source(-200).unwrap().enabled);
        assert!(config.source(-999).is_none());
    }
}
