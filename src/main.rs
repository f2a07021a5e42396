//! # Hangouts — conversational assistant host
//!
//! Runs the alarm service, the alarm event processor and the chat channels
//! as supervised tasks until Ctrl-C.
//!
//! Usage:
//!   hangouts                               # Console only
//!   hangouts --discord --discord-token .. --discord-user ..  # Deliver reminders as Discord DMs
//!   hangouts --config ./hangouts.toml -v   # Custom config, debug logging

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hangouts_core::config::HangoutsConfig;
use hangouts_runtime::{AppContext, Supervisor};

#[derive(Parser)]
#[command(
    name = "hangouts",
    version,
    about = "⏰ Hangouts — conversational assistant with natural-language reminders"
)]
struct Cli {
    /// Config file (default: ~/.hangouts/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable the Discord channel
    #[arg(long, conflicts_with = "no_discord")]
    discord: bool,

    /// Disable the Discord channel even if the config enables it
    #[arg(long)]
    no_discord: bool,

    /// Discord bot token (overrides config and DISCORD_TOKEN)
    #[arg(long)]
    discord_token: Option<String>,

    /// Discord user id that receives console-scheduled reminders
    #[arg(long)]
    discord_user: Option<String>,

    /// Database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut HangoutsConfig) {
        if self.discord {
            config.discord.enabled = true;
        }
        if self.no_discord {
            config.discord.enabled = false;
        }
        if let Some(token) = &self.discord_token {
            config.discord.bot_token = token.clone();
        }
        if let Some(user_id) = &self.discord_user {
            config.discord.user_id = user_id.clone();
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "hangouts=debug" } else { "hangouts=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => HangoutsConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HangoutsConfig::load()?,
    };
    config.apply_env();
    cli.apply(&mut config);

    let policy = config.supervisor.failure_policy;
    let mut ctx = AppContext::build(config).context("startup configuration")?;

    let mut supervisor = Supervisor::new(policy);
    ctx.spawn_all(&mut supervisor)?;
    tracing::info!("🚀 Hangouts running with {} tasks, Ctrl-C to stop", supervisor.len());

    let report = supervisor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("⚠️ Ctrl-C handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if report.any_failed() {
        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(name, outcome)| format!("{name}: {outcome:?}"))
            .collect();
        anyhow::bail!("task failure: {}", failed.join(", "));
    }
    Ok(())
}
