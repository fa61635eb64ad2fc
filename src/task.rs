use serde::{Deserialize, Serialize};

/// Prefix/suffix wrapped around the forwarded text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub prefix: String,
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub suffix: String,
}

/// One unit of forwarding work, as it travels through the queue.
///
/// Older producers wrote `chat_id` / `msg_id` / `media` / `qq_channel_id` /
/// `channel_name`; those keys are still accepted on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "chat_id")]
    pub source_id: i64,
    #[serde(alias = "msg_id")]
    pub message_id: i64,
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub text: String,
    #[serde(default, alias = "media", skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(
        default,
        alias = "qq_channel_id",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_channel_id"
    )]
    pub target_channel_id: Option<String>,
    #[serde(default, deserialize_with = "de_template")]
    pub template: Template,
    #[serde(default, alias = "channel_name", deserialize_with = "de_nullable_string")]
    pub display_name: String,
}

impl Task {
    pub fn identity(&self) -> (i64, i64) {
        (self.source_id, self.message_id)
    }

    pub fn has_media(&self) -> bool {
        self.media_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Best-effort `(source_id, message_id)` of a payload that does not decode
/// as a task; `0` for whatever is missing.
pub fn raw_identity(payload: &str) -> (i64, i64) {
    let value: serde_json::Value = serde_json::from_str(payload).unwrap_or_default();
    let field = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|k| match value.get(*k)? {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(0)
    };
    (field(["source_id", "chat_id"]), field(["message_id", "msg_id"]))
}

// Producers write `null` for empty text fields.
fn de_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Channel ids arrive as strings or bare numbers depending on the producer.
fn de_channel_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// `"template": null` is treated the same as an absent template.
fn de_template<'de, D>(deserializer: D) -> Result<Template, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Template>::deserialize(deserializer)?.unwrap_or_default())
}
