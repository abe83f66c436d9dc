use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use warden_common::{APP_NAME, WardenConfig, logging};
use warden_core::{InboundEvent, task_types};
use warden_discord::DiscordGateway;
use warden_gateway::TriagePipeline;
use warden_response::{AlertSink, GatewayError, ModerationGateway, ModeratorAlert};

#[derive(Debug, Parser)]
#[command(name = "warden", about = "WARDEN moderation triage service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate local setup and generate default config if missing.
    Doctor,
    /// Run the triage service against the configured Discord channels.
    Run,
    /// Feed a scripted set of messages through the pipeline offline.
    Simulate,
    /// Lift a guild lockdown (clears channel overwrites via the API).
    Unlock { guild_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Doctor) => doctor().await,
        Some(Command::Run) => run().await,
        Some(Command::Simulate) => simulate().await,
        Some(Command::Unlock { guild_id }) => unlock(&guild_id).await,
        None => {
            println!("{APP_NAME} CLI bootstrap complete.");
            println!("Run `warden doctor` to generate and validate local config.");
            Ok(())
        }
    }
}

fn load_initialized_config() -> Result<WardenConfig> {
    let (config, _, _) = WardenConfig::load_or_create()?;
    config.validate()?;
    logging::init(&config.log_level);
    Ok(config)
}

async fn doctor() -> Result<()> {
    let (config, path, created) = WardenConfig::load_or_create()?;
    config.validate()?;
    logging::init(&config.log_level);

    println!("{APP_NAME} doctor: OK");
    println!("config: {}", path.display());
    println!("created_config: {created}");
    println!("watch_channels: {}", config.discord.watch_channels.len());
    println!("queue_capacity: {}", config.scheduler.queue_capacity);
    println!("worker_ceiling: {}", config.scheduler.worker_ceiling);

    match env::var(&config.discord.token_env) {
        Ok(token) => {
            let gateway = DiscordGateway::new(&token, &config.discord)?;
            match gateway.healthcheck().await {
                Ok(identity) => {
                    println!("discord: OK ({} #{})", identity.username, identity.id);
                }
                Err(err) => println!("discord: FAILED ({err:#})"),
            }
        }
        Err(_) => println!("discord: token not set ({})", config.discord.token_env),
    }

    Ok(())
}

async fn run() -> Result<()> {
    let config = load_initialized_config()?;
    if config.discord.watch_channels.is_empty() {
        bail!("no watch channels configured; set discord.watch_channels in the config file");
    }
    let token = env::var(&config.discord.token_env)
        .with_context(|| format!("missing discord token env var {}", config.discord.token_env))?;
    let gateway = Arc::new(DiscordGateway::new(&token, &config.discord)?);

    let identity = gateway.healthcheck().await?;
    let bot_user_id = config
        .discord
        .bot_user_id
        .clone()
        .unwrap_or_else(|| identity.id.clone());
    info!(bot = %identity.username, "discord credentials verified");

    // Channel -> guild resolution happens once; lockdown and raid tracking
    // are keyed by guild.
    let mut channel_guilds: HashMap<String, String> = HashMap::new();
    for channel in &config.discord.watch_channels {
        let guild = gateway
            .channel_guild(channel)
            .await
            .with_context(|| format!("failed to resolve guild for channel {channel}"))?;
        channel_guilds.insert(channel.clone(), guild);
    }

    let pipeline = TriagePipeline::new(
        &config,
        Arc::clone(&gateway) as Arc<dyn ModerationGateway>,
        Arc::clone(&gateway) as Arc<dyn AlertSink>,
    );
    register_logging_handlers(&pipeline);

    let runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };

    // Start polling from the current head of each channel so restarts do
    // not re-moderate old history.
    let mut cursors: HashMap<String, Option<String>> = HashMap::new();
    for channel in &config.discord.watch_channels {
        let head = match gateway.list_recent_messages(channel, None, 1).await {
            Ok(messages) => messages.last().map(|m| m.id.clone()),
            Err(err) => {
                warn!(channel = %channel, error = %err, "failed to prime channel cursor");
                None
            }
        };
        cursors.insert(channel.clone(), head);
    }

    let mut poll = tokio::time::interval(Duration::from_millis(config.discord.poll_interval_ms));
    let mut housekeep = tokio::time::interval(Duration::from_secs(60));
    housekeep.tick().await; // the first tick fires immediately

    info!(
        channels = config.discord.watch_channels.len(),
        "triage service running, press ctrl-c to stop"
    );
    loop {
        tokio::select! {
            _ = poll.tick() => {
                poll_channels(
                    gateway.as_ref(),
                    pipeline.as_ref(),
                    &channel_guilds,
                    &mut cursors,
                    &bot_user_id,
                )
                .await;
            }
            _ = housekeep.tick() => {
                let report = pipeline.housekeeping(Utc::now()).await;
                let stats = pipeline.stats();
                info!(
                    queue_depth = stats.queue_depth,
                    active_workers = stats.active_workers,
                    enqueued = stats.enqueued,
                    dropped = stats.dropped_queue_full,
                    avg_latency_ms = stats.avg_latency_ms,
                    profiles_evicted = report.profiles_evicted,
                    quarantines_released = report.quarantines_released,
                    "periodic maintenance"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    pipeline.shutdown();
    runner.await.context("dispatch loop panicked")?;
    let stats = pipeline.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn poll_channels(
    gateway: &DiscordGateway,
    pipeline: &TriagePipeline,
    channel_guilds: &HashMap<String, String>,
    cursors: &mut HashMap<String, Option<String>>,
    bot_user_id: &str,
) {
    for (channel, guild) in channel_guilds {
        let after = cursors.get(channel).cloned().flatten();
        let messages = match gateway
            .list_recent_messages(channel, after.as_deref(), 50)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(channel = %channel, error = %err, "message poll failed");
                continue;
            }
        };
        for message in messages {
            cursors.insert(channel.clone(), Some(message.id.clone()));
            if let Some(event) = message.to_event(guild, Some(bot_user_id)) {
                pipeline.ingest(&event);
            }
        }
    }
}

/// Reply generation is out of scope for the triage service; the remaining
/// task types get lightweight observers so they are never skipped.
fn register_logging_handlers(pipeline: &TriagePipeline) {
    for task_type in [
        task_types::AI_RESPONSE,
        task_types::SUPPORT_RESPONSE,
        task_types::CONVERSATION,
    ] {
        pipeline.register_handler(task_type, move |task| async move {
            if let Some(event) = task.payload.message() {
                info!(
                    task_type = %task.task_type,
                    actor = %event.actor_name,
                    channel = %event.channel_id,
                    "triaged for follow-up"
                );
            }
            Ok(())
        });
    }
}

struct ConsoleGateway;

#[async_trait]
impl ModerationGateway for ConsoleGateway {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), GatewayError> {
        println!("action: delete_message channel={channel_id} message={message_id}");
        Ok(())
    }

    async fn timeout_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        until: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        println!("action: timeout guild={guild_id} actor={actor_id} until={until}");
        Ok(())
    }

    async fn ban_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        println!("action: ban guild={guild_id} actor={actor_id} reason={reason}");
        Ok(())
    }

    async fn dm_actor(&self, actor_id: &str, content: &str) -> Result<(), GatewayError> {
        println!("action: dm actor={actor_id} content={content}");
        Ok(())
    }

    async fn lockdown_guild(&self, guild_id: &str) -> Result<u32, GatewayError> {
        println!("action: lockdown guild={guild_id}");
        Ok(1)
    }

    async fn lift_lockdown(&self, guild_id: &str) -> Result<u32, GatewayError> {
        println!("action: lift_lockdown guild={guild_id}");
        Ok(1)
    }
}

#[async_trait]
impl AlertSink for ConsoleGateway {
    async fn send_alert(&self, alert: &ModeratorAlert) -> Result<(), GatewayError> {
        println!(
            "alert: urgent={} title={} | {}",
            alert.urgent,
            alert.title,
            alert.lines.join(" | ")
        );
        Ok(())
    }
}

async fn simulate() -> Result<()> {
    let config = load_initialized_config()?;
    let console = Arc::new(ConsoleGateway);
    let pipeline = TriagePipeline::new(
        &config,
        Arc::clone(&console) as Arc<dyn ModerationGateway>,
        console as Arc<dyn AlertSink>,
    );
    register_logging_handlers(&pipeline);

    let runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };

    let now = Utc::now();
    let scripted = [
        ("alice", "good morning everyone, lovely day", 400),
        ("bob", "how do I change my avatar?", 300),
        (
            "mallory",
            "Free Discord Nitro! Click to verify your account now, limited time! https://bit.ly/xyz",
            1,
        ),
        (
            "trent",
            "claim your prize! just send me your token and password https://bit.ly/claim",
            2,
        ),
        ("alice", "anyone up for a game later tonight", 400),
    ];
    for (actor, content, account_age_days) in scripted {
        let event = InboundEvent {
            guild_id: "demo-guild".to_string(),
            channel_id: "demo-channel".to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor.to_string(),
            actor_name: actor.to_string(),
            actor_created_at: now - chrono::Duration::days(account_age_days),
            content: content.to_string(),
            mention_count: 0,
            mentions_bot: false,
            timestamp: now,
        };
        let outcome = pipeline.ingest(&event);
        println!("ingest: actor={actor} outcome={outcome:?}");
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.shutdown();
    runner.await.context("dispatch loop panicked")?;

    let stats = pipeline.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn unlock(guild_id: &str) -> Result<()> {
    let config = load_initialized_config()?;
    let token = env::var(&config.discord.token_env)
        .with_context(|| format!("missing discord token env var {}", config.discord.token_env))?;
    let gateway = DiscordGateway::new(&token, &config.discord)?;
    let unlocked = gateway.lift_lockdown(guild_id).await?;
    println!("unlocked_channels: {unlocked}");
    Ok(())
}
