//! Discord REST adapter: message polling plus the moderation actions the
//! response layer needs.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use warden_common::DiscordConfig;
use warden_core::InboundEvent;
use warden_response::{AlertSink, GatewayError, ModerationGateway, ModeratorAlert};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

// SEND_MESSAGES (1 << 11) | ADD_REACTIONS (1 << 6), applied to the
// @everyone role during lockdown.
const LOCKDOWN_DENY_MASK: u64 = 2112;

/// Creation time encoded in a snowflake id. `None` for ids that are not
/// valid snowflakes.
pub fn snowflake_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let raw: u64 = id.trim().parse().ok()?;
    let millis = (raw >> 22) + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[derive(Debug, Clone)]
pub struct DiscordGateway {
    client: Client,
    bot_user_id: Option<String>,
    alert_channel_id: Option<String>,
    moderator_role_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordBotIdentity {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessageRef {
    pub id: String,
    pub channel_id: String,
}

const TEXT_CHANNEL_TYPE: u8 = 0;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannelInfo {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<u8>,
    #[serde(default)]
    pub guild_id: Option<String>,
}

fn text_channel_ids(channels: &[DiscordChannelInfo]) -> Vec<String> {
    channels
        .iter()
        .filter(|channel| channel.kind == Some(TEXT_CHANNEL_TYPE))
        .map(|channel| channel.id.clone())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordInboundMessage {
    pub id: String,
    pub channel_id: String,
    pub content: String,
    pub author: DiscordMessageAuthor,
    #[serde(default)]
    pub mentions: Vec<DiscordUserRef>,
    #[serde(default)]
    pub mention_everyone: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessageAuthor {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUserRef {
    pub id: String,
}

impl DiscordInboundMessage {
    /// Converts a polled message into a pipeline event. Bot authors are
    /// dropped so the pipeline never triages its own output.
    pub fn to_event(&self, guild_id: &str, bot_user_id: Option<&str>) -> Option<InboundEvent> {
        if self.author.bot {
            return None;
        }
        if bot_user_id.is_some_and(|id| id == self.author.id) {
            return None;
        }
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .ok()?;
        let actor_created_at = snowflake_timestamp(&self.author.id).unwrap_or(timestamp);
        let mut mention_count = self.mentions.len() as u32;
        if self.mention_everyone {
            // @everyone is a mass ping on its own.
            mention_count += 10;
        }
        let mentions_bot =
            bot_user_id.is_some_and(|id| self.mentions.iter().any(|m| m.id == id));
        Some(InboundEvent {
            guild_id: guild_id.to_string(),
            channel_id: self.channel_id.clone(),
            message_id: self.id.clone(),
            actor_id: self.author.id.clone(),
            actor_name: self.author.username.clone(),
            actor_created_at,
            content: self.content.clone(),
            mention_count,
            mentions_bot,
            timestamp,
        })
    }
}

impl DiscordGateway {
    pub fn new(token: &str, cfg: &DiscordConfig) -> Result<Self> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            bail!("discord token is empty");
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bot {trimmed}"))
                .with_context(|| "failed to build discord authorization header")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.api_timeout_ms))
            .default_headers(headers)
            .build()
            .with_context(|| "failed to build discord HTTP client")?;

        Ok(Self {
            client,
            bot_user_id: cfg.bot_user_id.clone(),
            alert_channel_id: cfg.alert_channel_id.clone(),
            moderator_role_id: cfg.moderator_role_id.clone(),
        })
    }

    pub fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    pub async fn healthcheck(&self) -> Result<DiscordBotIdentity> {
        let response = self
            .client
            .get(format!("{DISCORD_API_BASE}/users/@me"))
            .send()
            .await
            .with_context(|| "failed to call discord users/@me")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord healthcheck failed: {} {}", status.as_u16(), body);
        }
        let identity = response
            .json::<DiscordBotIdentity>()
            .await
            .with_context(|| "failed to parse discord identity")?;
        Ok(identity)
    }

    pub async fn channel_guild(&self, channel_id: &str) -> Result<String> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            bail!("channel_id is required");
        }
        let response = self
            .client
            .get(format!("{DISCORD_API_BASE}/channels/{channel_id}"))
            .send()
            .await
            .with_context(|| "failed to fetch discord channel")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord channel lookup failed: {} {}", status.as_u16(), body);
        }
        let info = response
            .json::<DiscordChannelInfo>()
            .await
            .with_context(|| "failed to parse discord channel response")?;
        info.guild_id
            .with_context(|| format!("channel {} is not a guild channel", info.id))
    }

    pub async fn list_recent_messages(
        &self,
        channel_id: &str,
        after_message_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiscordInboundMessage>> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            bail!("channel_id is required");
        }
        let bounded_limit = limit.clamp(1, 100);
        let mut request = self
            .client
            .get(format!("{DISCORD_API_BASE}/channels/{channel_id}/messages"))
            .query(&[("limit", bounded_limit.to_string())]);
        if let Some(after) = after_message_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            request = request.query(&[("after", after.to_string())]);
        }
        let response = request
            .send()
            .await
            .with_context(|| "failed to fetch discord channel messages")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord list messages failed: {} {}", status.as_u16(), body);
        }
        let mut messages = response
            .json::<Vec<DiscordInboundMessage>>()
            .await
            .with_context(|| "failed to parse discord messages response")?;
        messages.sort_by_key(|msg| msg.id.parse::<u64>().unwrap_or_default());
        Ok(messages)
    }

    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<DiscordMessageRef> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            bail!("channel_id is required");
        }
        if content.trim().is_empty() {
            bail!("content is required");
        }
        let response = self
            .client
            .post(format!("{DISCORD_API_BASE}/channels/{channel_id}/messages"))
            .json(&serde_json::json!({
                "content": content,
                "allowed_mentions": { "parse": ["roles"] }
            }))
            .send()
            .await
            .with_context(|| "failed to send discord message")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord send failed: {} {}", status.as_u16(), body);
        }
        let message = response
            .json::<DiscordMessageRef>()
            .await
            .with_context(|| "failed to parse discord message response")?;
        Ok(message)
    }

    async fn send_alert_payload(&self, channel_id: &str, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{DISCORD_API_BASE}/channels/{channel_id}/messages"))
            .json(body)
            .send()
            .await
            .with_context(|| "failed to send discord alert")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord alert failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    async fn delete_message_inner(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{DISCORD_API_BASE}/channels/{channel_id}/messages/{message_id}"
            ))
            .send()
            .await
            .with_context(|| "failed to delete discord message")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord delete failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    async fn timeout_member_inner(
        &self,
        guild_id: &str,
        actor_id: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let response = self
            .client
            .patch(format!(
                "{DISCORD_API_BASE}/guilds/{guild_id}/members/{actor_id}"
            ))
            .json(&serde_json::json!({
                "communication_disabled_until": until.to_rfc3339()
            }))
            .send()
            .await
            .with_context(|| "failed to timeout discord member")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord timeout failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    async fn ban_member_inner(&self, guild_id: &str, actor_id: &str, reason: &str) -> Result<()> {
        let response = self
            .client
            .put(format!("{DISCORD_API_BASE}/guilds/{guild_id}/bans/{actor_id}"))
            .header("X-Audit-Log-Reason", reason)
            .json(&serde_json::json!({ "delete_message_seconds": 3600 }))
            .send()
            .await
            .with_context(|| "failed to ban discord member")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord ban failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    async fn dm_actor_inner(&self, actor_id: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{DISCORD_API_BASE}/users/@me/channels"))
            .json(&serde_json::json!({ "recipient_id": actor_id }))
            .send()
            .await
            .with_context(|| "failed to open discord DM channel")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord DM open failed: {} {}", status.as_u16(), body);
        }
        let channel = response
            .json::<DiscordMessageRef>()
            .await
            .with_context(|| "failed to parse discord DM channel")?;
        self.send_message(&channel.id, content).await?;
        Ok(())
    }

    async fn set_lockdown_overwrite(&self, channel_id: &str, guild_id: &str) -> Result<()> {
        // The @everyone role id equals the guild id.
        let response = self
            .client
            .put(format!(
                "{DISCORD_API_BASE}/channels/{channel_id}/permissions/{guild_id}"
            ))
            .json(&serde_json::json!({
                "type": 0,
                "allow": "0",
                "deny": LOCKDOWN_DENY_MASK.to_string()
            }))
            .send()
            .await
            .with_context(|| "failed to set discord channel overwrite")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord overwrite failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    async fn clear_lockdown_overwrite(&self, channel_id: &str, guild_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{DISCORD_API_BASE}/channels/{channel_id}/permissions/{guild_id}"
            ))
            .send()
            .await
            .with_context(|| "failed to clear discord channel overwrite")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("discord overwrite clear failed: {} {}", status.as_u16(), body);
        }
        Ok(())
    }

    /// Text channels of a guild; lockdown touches all of them, not just
    /// the watched ones.
    pub async fn list_guild_text_channels(&self, guild_id: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{DISCORD_API_BASE}/guilds/{guild_id}/channels"))
            .send()
            .await
            .with_context(|| "failed to fetch discord guild channels")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "discord guild channels failed: {} {}",
                status.as_u16(),
                body
            );
        }
        let channels = response
            .json::<Vec<DiscordChannelInfo>>()
            .await
            .with_context(|| "failed to parse discord guild channels")?;
        Ok(text_channel_ids(&channels))
    }
}

fn transport(err: anyhow::Error) -> GatewayError {
    GatewayError::Transport(format!("{err:#}"))
}

#[async_trait]
impl ModerationGateway for DiscordGateway {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), GatewayError> {
        self.delete_message_inner(channel_id, message_id)
            .await
            .map_err(transport)
    }

    async fn timeout_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        until: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.timeout_member_inner(guild_id, actor_id, until)
            .await
            .map_err(transport)
    }

    async fn ban_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        self.ban_member_inner(guild_id, actor_id, reason)
            .await
            .map_err(transport)
    }

    async fn dm_actor(&self, actor_id: &str, content: &str) -> Result<(), GatewayError> {
        self.dm_actor_inner(actor_id, content)
            .await
            .map_err(transport)
    }

    async fn lockdown_guild(&self, guild_id: &str) -> Result<u32, GatewayError> {
        let channels = self
            .list_guild_text_channels(guild_id)
            .await
            .map_err(transport)?;
        if channels.is_empty() {
            return Err(GatewayError::Rejected(format!(
                "no text channels for guild {guild_id}"
            )));
        }
        let mut locked = 0;
        for channel_id in &channels {
            self.set_lockdown_overwrite(channel_id, guild_id)
                .await
                .map_err(transport)?;
            locked += 1;
        }
        Ok(locked)
    }

    async fn lift_lockdown(&self, guild_id: &str) -> Result<u32, GatewayError> {
        let channels = self
            .list_guild_text_channels(guild_id)
            .await
            .map_err(transport)?;
        let mut unlocked = 0;
        for channel_id in &channels {
            self.clear_lockdown_overwrite(channel_id, guild_id)
                .await
                .map_err(transport)?;
            unlocked += 1;
        }
        Ok(unlocked)
    }
}

const ALERT_COLOR_URGENT: u32 = 0x00E7_4C3C;
const ALERT_COLOR_NOTICE: u32 = 0x00F3_9C12;

#[async_trait]
impl AlertSink for DiscordGateway {
    async fn send_alert(&self, alert: &ModeratorAlert) -> Result<(), GatewayError> {
        let Some(channel_id) = self.alert_channel_id.as_deref() else {
            return Err(GatewayError::Rejected(
                "no alert channel configured".to_string(),
            ));
        };
        let mut content = String::new();
        if alert.urgent
            && let Some(role) = self.moderator_role_id.as_deref()
        {
            content = format!("<@&{role}>");
        }
        let color = if alert.urgent {
            ALERT_COLOR_URGENT
        } else {
            ALERT_COLOR_NOTICE
        };
        let body = serde_json::json!({
            "content": content,
            "embeds": [{
                "title": alert.title,
                "description": alert.lines.join("\n"),
                "color": color
            }],
            "allowed_mentions": { "parse": ["roles"] }
        });
        self.send_alert_payload(channel_id, &body)
            .await
            .map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflake_timestamp_decodes_known_id() {
        // Reference id from the Discord snowflake documentation.
        let ts = snowflake_timestamp("175928847299117063").expect("timestamp");
        assert_eq!(ts.to_rfc3339(), "2016-04-30T11:18:25.796+00:00");
    }

    #[test]
    fn snowflake_timestamp_rejects_garbage() {
        assert!(snowflake_timestamp("not-a-snowflake").is_none());
        assert!(snowflake_timestamp("").is_none());
    }

    #[test]
    fn inbound_message_converts_to_event() {
        let raw = serde_json::json!({
            "id": "900000000000000000",
            "channel_id": "123",
            "content": "hello <@42>",
            "author": { "id": "175928847299117063", "username": "someone" },
            "mentions": [{ "id": "42" }],
            "timestamp": "2024-06-01T12:00:00+00:00"
        });
        let message: DiscordInboundMessage = serde_json::from_value(raw).expect("parse");
        let event = message.to_event("guild-1", Some("42")).expect("event");
        assert_eq!(event.actor_id, "175928847299117063");
        assert_eq!(event.mention_count, 1);
        assert!(event.mentions_bot);
        assert_eq!(event.actor_created_at.to_rfc3339(), "2016-04-30T11:18:25.796+00:00");
    }

    #[test]
    fn bot_authors_are_dropped() {
        let raw = serde_json::json!({
            "id": "900000000000000001",
            "channel_id": "123",
            "content": "beep",
            "author": { "id": "7", "username": "bot", "bot": true },
            "timestamp": "2024-06-01T12:00:00+00:00"
        });
        let message: DiscordInboundMessage = serde_json::from_value(raw).expect("parse");
        assert!(message.to_event("guild-1", None).is_none());
    }

    #[test]
    fn lockdown_targets_only_text_channels() {
        let raw = serde_json::json!([
            { "id": "100", "type": 0, "guild_id": "guild-1" },
            { "id": "101", "type": 2, "guild_id": "guild-1" },
            { "id": "102", "type": 4, "guild_id": "guild-1" },
            { "id": "103", "type": 0, "guild_id": "guild-1" },
            { "id": "104", "type": 5, "guild_id": "guild-1" }
        ]);
        let channels: Vec<DiscordChannelInfo> = serde_json::from_value(raw).expect("parse");
        assert_eq!(text_channel_ids(&channels), vec!["100", "103"]);
    }

    #[test]
    fn everyone_mention_counts_as_mass_ping() {
        let raw = serde_json::json!({
            "id": "900000000000000002",
            "channel_id": "123",
            "content": "@everyone look",
            "author": { "id": "8", "username": "pinger" },
            "mention_everyone": true,
            "timestamp": "2024-06-01T12:00:00+00:00"
        });
        let message: DiscordInboundMessage = serde_json::from_value(raw).expect("parse");
        let event = message.to_event("guild-1", None).expect("event");
        assert!(event.mention_count >= 10);
    }
}
