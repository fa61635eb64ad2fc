use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tg2qq", about = "Relay source channel posts into a QQ guild channel")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true, env = "TG2QQ_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the dispatch worker and the gateway keepalive (default).
    Run,
    /// Print queue length, today's counters and the dead letter count.
    Stats,
    /// Inspect or replay dead letters.
    Deadletters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Push one source message through admission into the queue.
    Ingest {
        #[arg(allow_negative_numbers = true)]
        source_id: i64,
        message_id: i64,
        text: String,
        /// Local path of an attached photo.
        #[arg(long)]
        media: Option<String>,
        /// Source chat title, available to templates as {{channel_name}}.
        #[arg(long, default_value = "")]
        display_name: String,
    },
    /// Look up guilds and channels on the destination platform.
    Qq {
        #[command(subcommand)]
        action: QqAction,
    },
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum QqAction {
    /// Guilds the bot has joined.
    Guilds,
    /// Channels of a guild.
    Channels { guild_id: String },
    /// Show which channel would be picked when only the guild is configured.
    PickChannel { guild_id: String },
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum DeadLetterAction {
    /// Most recent first.
    List {
        #[arg(default_value_t = 20)]
        limit: usize,
    },
    /// Push the given dead letters back onto the queue and delete them.
    Retry {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Run)
    }
}
