use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::IncomingMessage;
use crate::config::{Config, SourceConfig};
use crate::pipeline::{admit, sample, CompiledRule};
use crate::store::{ProcessedLedger, Store, TaskQueue};
use crate::task::Task;

/// Why a message was or was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestDecision {
    Enqueued,
    /// Already forwarded successfully.
    Duplicate,
    Blacklisted,
    /// No `[[sources]]` entry for this chat.
    Unmapped,
    Disabled,
    /// Dropped by the source's gray ratio.
    SampledOut,
    /// Rejected by the source's filter rule.
    Filtered,
}

struct Route {
    source: SourceConfig,
    rule: Option<CompiledRule>,
}

/// Queue-side admission for messages coming from the source platform.
pub struct Ingestor {
    queue: TaskQueue,
    processed: ProcessedLedger,
    blacklist: HashSet<i64>,
    routes: HashMap<i64, Route>,
}

impl Ingestor {
    pub fn new(store: &Store, config: &Config) -> Self {
        let routes = config
            .sources
            .iter()
            .map(|source| {
                let route = Route {
                    rule: source.filter.as_ref().map(CompiledRule::compile),
                    source: source.clone(),
                };
                (source.source_id, route)
            })
            .collect();

        Self {
            queue: store.queue(),
            processed: store.processed(),
            blacklist: config.blacklist.iter().copied().collect(),
            routes,
        }
    }

    /// Run the admission chain and enqueue the message if it passes.
    pub async fn ingest(&self, message: IncomingMessage) -> Result<IngestDecision> {
        let route = match self.route(&message).await? {
            Ok(route) => route,
            Err(decision) => {
                debug!(
                    "Ignoring source_id={} message_id={}: {:?}",
                    message.source_id, message.message_id, decision
                );
                return Ok(decision);
            }
        };

        let task = Task {
            source_id: message.source_id,
            message_id: message.message_id,
            text: message.text,
            media_path: message.media_path,
            target_channel_id: route.source.target_channel_id.clone(),
            template: route.source.template.clone(),
            display_name: message.display_name,
        };
        self.queue.push(&task).await?;
        debug!(
            "Enqueued source_id={} message_id={}",
            task.source_id, task.message_id
        );
        Ok(IngestDecision::Enqueued)
    }

    /// Order: processed, blacklist, mapping, enabled, gray ratio, filter.
    async fn route(
        &self,
        message: &IncomingMessage,
    ) -> Result<std::result::Result<&Route, IngestDecision>> {
        if self
            .processed
            .is_processed(message.source_id, message.message_id)
            .await?
        {
            return Ok(Err(IngestDecision::Duplicate));
        }
        if self.blacklist.contains(&message.source_id) {
            return Ok(Err(IngestDecision::Blacklisted));
        }
        let Some(route) = self.routes.get(&message.source_id) else {
            return Ok(Err(IngestDecision::Unmapped));
        };
        if !route.source.enabled {
            return Ok(Err(IngestDecision::Disabled));
        }
        if !sample(route.source.gray_ratio) {
            return Ok(Err(IngestDecision::SampledOut));
        }
        if !admit(&message.text, route.rule.as_ref()) {
            return Ok(Err(IngestDecision::Filtered));
        }
        Ok(Ok(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        blacklist = [-300]

        [qq]
        access_token = "t"

        [[sources]]
        source_id = -100
        target_channel_id = "634"
        template = { prefix = "[{{channel_name}}] ", suffix = "" }
        filter = { block_keywords = ["spam"], allow_keywords = ["资源"], require_allow = true }

        [[sources]]
        source_id = -200
        enabled = false

        [[sources]]
        source_id = -300

        [[sources]]
        source_id = -400
        gray_ratio = 0
    "#;

    fn message(source_id: i64, message_id: i64, text: &str) -> IncomingMessage {
        IncomingMessage {
            source_id,
            message_id,
            text: text.to_string(),
            media_path: Some("/tmp/-100_1.jpg".to_string()),
            display_name: "影视频道".to_string(),
        }
    }

    fn setup() -> (Store, Ingestor) {
        let store = Store::open_in_memory().unwrap();
        let config = Config::parse(CONFIG).unwrap();
        let ingestor = Ingestor::new(&store, &config);
        (store, ingestor)
    }

    #[tokio::test]
    async fn test_admitted_message_becomes_task() {
        let (store, ingestor) = setup();

        let decision = ingestor.ingest(message(-100, 1, "新资源")).await.unwrap();
        assert_eq!(decision, IngestDecision::Enqueued);

        let entry = store.queue().try_pop().await.unwrap().unwrap();
        let task: Task = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(task.identity(), (-100, 1));
        assert_eq!(task.text, "新资源");
        assert_eq!(task.target_channel_id.as_deref(), Some("634"));
        assert_eq!(task.template.prefix, "[{{channel_name}}] ");
        assert_eq!(task.display_name, "影视频道");
        assert!(task.has_media());
    }

    #[tokio::test]
    async fn test_rejections() {
        let (store, ingestor) = setup();

        let cases = [
            (message(-300, 1, "资源"), IngestDecision::Blacklisted),
            (message(-999, 1, "资源"), IngestDecision::Unmapped),
            (message(-200, 1, "资源"), IngestDecision::Disabled),
            (message(-400, 1, "资源"), IngestDecision::SampledOut),
            (message(-100, 2, "spam 资源"), IngestDecision::Filtered),
            (message(-100, 3, "no allow term"), IngestDecision::Filtered),
        ];
        for (msg, expected) in cases {
            assert_eq!(ingestor.ingest(msg).await.unwrap(), expected);
        }
        assert_eq!(store.queue().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_processed_message_is_duplicate() {
        let (store, ingestor) = setup();
        store.processed().mark_processed(-100, 5).await.unwrap();

        assert_eq!(
            ingestor.ingest(message(-100, 5, "资源")).await.unwrap(),
            IngestDecision::Duplicate
        );
        assert_eq!(
            ingestor.ingest(message(-100, 6, "资源")).await.unwrap(),
            IngestDecision::Enqueued
        );
    }
}
