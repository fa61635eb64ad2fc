pub mod ingest;

pub use ingest::{IngestDecision, Ingestor};

/// A message observed on the source platform, as handed over by the
/// listening client.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Source chat/channel id
    pub source_id: i64,
    /// Message id within the source chat
    pub message_id: i64,
    /// The message text (caption for media messages)
    pub text: String,
    /// Local path of the first downloaded photo, if any
    pub media_path: Option<String>,
    /// Title of the source chat
    pub display_name: String,
}
