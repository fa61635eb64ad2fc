mod cli;
mod config;
mod pipeline;
mod platform;
mod qq;
mod scheduler;
mod store;
mod task;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, DeadLetterAction, QqAction};
use crate::config::Config;
use crate::pipeline::Normalizer;
use crate::platform::{IncomingMessage, Ingestor};
use crate::qq::{
    pick_default_channel, AccessTokenCache, AlwaysOnline, GatewayKeepAlive, QqApi, SessionGate,
};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::worker::DispatchWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tg2qq=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from: {}", cli.config.display());
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let store = Store::open(&config.store.database_path)?;

    match cli.command() {
        Command::Run => run(config, store).await,
        Command::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Deadletters { action } => dead_letters(&store, action).await,
        Command::Ingest {
            source_id,
            message_id,
            text,
            media,
            display_name,
        } => {
            let decision = Ingestor::new(&store, &config)
                .ingest(IncomingMessage {
                    source_id: *source_id,
                    message_id: *message_id,
                    text: text.clone(),
                    media_path: media.clone(),
                    display_name: display_name.clone(),
                })
                .await?;
            println!("{:?}", decision);
            Ok(())
        }
        Command::Qq { action } => {
            for line in qq_lookup(&build_api(&config), action).await? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

fn build_api(config: &Config) -> Arc<QqApi> {
    let tokens = Arc::new(AccessTokenCache::new(
        &config.qq,
        config.worker.request_timeout(),
    ));
    Arc::new(QqApi::new(&config.qq, &config.worker, tokens))
}

async fn qq_lookup(api: &QqApi, action: &QqAction) -> Result<Vec<String>> {
    let lines: Vec<String> = match action {
        QqAction::Guilds => api
            .guilds()
            .await?
            .iter()
            .map(|g| format!("{}\t{}", field(g, "id"), field(g, "name")))
            .collect(),
        QqAction::Channels { guild_id } => api
            .guild_channels(guild_id)
            .await?
            .iter()
            .map(|ch| {
                format!(
                    "{}\t{}\t{}\t{}",
                    field(ch, "id"),
                    field(ch, "type"),
                    field(ch, "speak_permission"),
                    field(ch, "name")
                )
            })
            .collect(),
        QqAction::PickChannel { guild_id } => {
            let channels = api.guild_channels(guild_id).await?;
            match pick_default_channel(&channels) {
                Some(id) => vec![id],
                None => anyhow::bail!("No usable channel found in guild {}", guild_id),
            }
        }
    };
    Ok(lines)
}

fn field(value: &serde_json::Value, key: &str) -> String {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

async fn dead_letters(store: &Store, action: &DeadLetterAction) -> Result<()> {
    let dead_letters = store.dead_letters();
    match action {
        DeadLetterAction::List { limit } => {
            for letter in dead_letters.list(*limit).await? {
                println!(
                    "{}\t{}\t{}/{}\t{}\t{}",
                    letter.id,
                    letter.created_at,
                    letter.source_id,
                    letter.message_id,
                    letter.error,
                    letter.preview().replace('\n', " ")
                );
            }
        }
        DeadLetterAction::Retry { ids } => {
            let requeued = dead_letters.replay(ids).await?;
            println!("Requeued {} dead letter(s)", requeued);
        }
    }
    Ok(())
}

async fn run(config: Config, store: Store) -> Result<()> {
    let api = build_api(&config);

    let guild_id = config
        .qq
        .target_guild_id
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty());
    let static_channel = match (config.qq.static_channel_id(), guild_id) {
        (Some(channel), _) => Some(channel.to_string()),
        (None, Some(guild)) => api.resolve_default_channel(guild).await,
        (None, None) => None,
    };
    match &static_channel {
        Some(channel) => info!("  Target channel: {}", channel),
        None => warn!("No target channel configured; tasks without their own channel will be dead-lettered"),
    }

    let keepalive = config
        .gateway
        .enabled
        .then(|| Arc::new(GatewayKeepAlive::new(Arc::clone(&api), config.gateway.clone())));
    let gate: Arc<dyn SessionGate> = match &keepalive {
        Some(keepalive) => {
            keepalive.start();
            Arc::clone(keepalive) as Arc<dyn SessionGate>
        }
        None => {
            warn!("Gateway keepalive disabled; sends may be rejected as offline");
            Arc::new(AlwaysOnline)
        }
    };

    let mut scheduler = Scheduler::new().await?;
    crate::scheduler::tasks::register_builtin_jobs(&scheduler, store.clone()).await?;
    scheduler.start().await?;

    let normalizer = Normalizer::new(&config.normalize)?;
    let worker = DispatchWorker::new(
        &store,
        api,
        gate,
        normalizer,
        static_channel,
        config.worker.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Ctrl-C received, shutting down");
            shutdown.cancel();
        }
    });

    info!("Relay is starting...");
    worker.run(shutdown).await;

    if let Some(keepalive) = &keepalive {
        keepalive.stop();
    }
    scheduler.shutdown().await?;
    Ok(())
}
