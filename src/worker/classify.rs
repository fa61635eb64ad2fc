/// How a failed send should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credential rejected or missing: force a token refresh, then retry once.
    Auth,
    /// The bot is not online on the gateway: wait for readiness, then retry once.
    OnlineRequired,
    /// Anything else goes straight to the dead letters.
    Other,
}

/// Last failure of a send attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendFailure {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    Transport(String),
}

const AUTH_MARKERS: [&str; 4] = ["unauthorized", "access_token", "token", "auth"];
const ONLINE_MARKERS: [&str; 4] = ["websocket", "gateway", "offline", "not online"];

/// Classify a failed send by status code and error text.
pub fn classify(failure: &SendFailure) -> ErrorClass {
    let text = match failure {
        SendFailure::Http { status: 401 | 403, .. } => return ErrorClass::Auth,
        SendFailure::Http { body, .. } => body.to_lowercase(),
        SendFailure::Transport(message) => message.to_lowercase(),
    };

    if AUTH_MARKERS.iter().any(|m| text.contains(m)) {
        ErrorClass::Auth
    } else if ONLINE_MARKERS.iter().any(|m| text.contains(m)) || mentions_ws(&text) {
        ErrorClass::OnlineRequired
    } else {
        ErrorClass::Other
    }
}

// "ws" as a whole word only, so "news" or "laws" don't count.
fn mentions_ws(text: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == "ws")
}
