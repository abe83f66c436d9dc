//! Graduated autonomous responses to threat assessments.
//!
//! The controller turns an assessment into concrete moderation actions
//! through the [`ModerationGateway`] seam. Platform failures degrade
//! individual actions (with a warning) rather than aborting the ladder;
//! the only hard stop is deduplication.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_common::ResponsePolicy;
use warden_core::InboundEvent;
use warden_threat::{AnalysisContext, ThreatAssessment, ThreatLevel};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("moderation action rejected: {0}")]
    Rejected(String),
    #[error("platform transport failure: {0}")]
    Transport(String),
}

/// Moderation actions the response layer can take against the platform.
/// Implemented by the REST adapter in production and by mocks in tests.
#[async_trait]
pub trait ModerationGateway: Send + Sync {
    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), GatewayError>;

    async fn timeout_member(
        &self,
        guild_id: &str,
        actor_id: &str,
        until: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn ban_member(&self, guild_id: &str, actor_id: &str, reason: &str)
    -> Result<(), GatewayError>;

    async fn dm_actor(&self, actor_id: &str, content: &str) -> Result<(), GatewayError>;

    /// Restricts posting guild-wide; returns how many channels were locked.
    async fn lockdown_guild(&self, guild_id: &str) -> Result<u32, GatewayError>;

    /// Reverses [`Self::lockdown_guild`]; returns how many channels were unlocked.
    async fn lift_lockdown(&self, guild_id: &str) -> Result<u32, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct ModeratorAlert {
    pub guild_id: String,
    pub urgent: bool,
    pub title: String,
    pub lines: Vec<String>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: &ModeratorAlert) -> Result<(), GatewayError>;
}

/// One assessed incident. The id is a content hash so the same message
/// assessed twice produces the same event.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub actor_id: String,
    pub level: ThreatLevel,
    pub reasons: Vec<String>,
    /// Truncated offending content, carried for moderator alerts.
    pub snippet: String,
    pub at: DateTime<Utc>,
}

const SNIPPET_MAX_CHARS: usize = 120;

impl SecurityEvent {
    pub fn from_assessment(assessment: &ThreatAssessment, event: &InboundEvent) -> Self {
        let reasons: Vec<String> = assessment.reasons.iter().map(|r| (*r).to_string()).collect();
        let mut hasher = Sha256::new();
        hasher.update(event.guild_id.as_bytes());
        hasher.update(b":");
        hasher.update(event.channel_id.as_bytes());
        hasher.update(b":");
        hasher.update(event.message_id.as_bytes());
        hasher.update(b":");
        hasher.update(event.actor_id.as_bytes());
        hasher.update(b":");
        hasher.update(reasons.join(",").as_bytes());
        let digest = hasher.finalize();
        let id = digest
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self {
            id,
            guild_id: event.guild_id.clone(),
            channel_id: event.channel_id.clone(),
            message_id: event.message_id.clone(),
            actor_id: event.actor_id.clone(),
            level: assessment.level,
            reasons,
            snippet: event.content.chars().take(SNIPPET_MAX_CHARS).collect(),
            at: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    RecordedOnly,
    MessageDeleted,
    TimedOut { hours: i64 },
    Banned,
    BanFallbackTimeout { hours: i64 },
    WarningSent,
    AlertSent { urgent: bool },
    Quarantined,
}

#[derive(Debug, Clone)]
pub struct ResponseOutcome {
    pub event_id: String,
    pub level: ThreatLevel,
    pub actions: Vec<ResponseAction>,
    pub deduplicated: bool,
    pub lockdown_engaged: bool,
}

#[derive(Debug, Clone)]
pub struct LockdownState {
    pub engaged_at: DateTime<Utc>,
    pub last_critical_at: DateTime<Utc>,
}

#[derive(Default)]
struct ResponseState {
    seen_events: HashMap<String, DateTime<Utc>>,
    actor_last_event: HashMap<String, DateTime<Utc>>,
    critical_timeline: HashMap<String, VecDeque<DateTime<Utc>>>,
    quarantined: HashMap<String, DateTime<Utc>>,
    lockdowns: HashMap<String, LockdownState>,
}

pub struct ResponseController {
    policy: ResponsePolicy,
    gateway: Arc<dyn ModerationGateway>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<ResponseState>,
}

// Decisions are taken under the state lock; platform calls happen after
// it is released so a slow API never blocks sibling assessments.
struct Plan {
    event: SecurityEvent,
    engage_lockdown: bool,
}

impl ResponseController {
    pub fn new(
        policy: ResponsePolicy,
        gateway: Arc<dyn ModerationGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            policy,
            gateway,
            alerts,
            state: Mutex::new(ResponseState::default()),
        }
    }

    /// Applies the graduated response ladder for one assessment. Duplicate
    /// events short-circuit before any platform call.
    pub async fn apply(
        &self,
        assessment: &ThreatAssessment,
        event: &InboundEvent,
    ) -> ResponseOutcome {
        let security = SecurityEvent::from_assessment(assessment, event);

        let plan = {
            let mut state = self.state.lock().await;
            if state.seen_events.contains_key(&security.id) {
                return ResponseOutcome {
                    event_id: security.id,
                    level: security.level,
                    actions: Vec::new(),
                    deduplicated: true,
                    lockdown_engaged: false,
                };
            }
            state.seen_events.insert(security.id.clone(), security.at);
            state
                .actor_last_event
                .insert(security.actor_id.clone(), security.at);

            if security.level >= ThreatLevel::High {
                state
                    .quarantined
                    .entry(security.actor_id.clone())
                    .or_insert(security.at);
            }

            let mut engage_lockdown = false;
            if security.level >= ThreatLevel::Critical {
                let window = Duration::seconds(self.policy.emergency_window_secs);
                let timeline = state
                    .critical_timeline
                    .entry(security.guild_id.clone())
                    .or_default();
                timeline.push_back(security.at);
                while timeline
                    .front()
                    .is_some_and(|at| security.at - *at > window)
                {
                    timeline.pop_front();
                }
                let burst = timeline.len();

                match state.lockdowns.get_mut(&security.guild_id) {
                    Some(lockdown) => lockdown.last_critical_at = security.at,
                    None if burst >= self.policy.emergency_event_min => {
                        state.lockdowns.insert(
                            security.guild_id.clone(),
                            LockdownState {
                                engaged_at: security.at,
                                last_critical_at: security.at,
                            },
                        );
                        engage_lockdown = true;
                    }
                    None => {}
                }
            }

            Plan {
                event: security,
                engage_lockdown,
            }
        };

        self.act(plan, event).await
    }

    async fn act(&self, plan: Plan, event: &InboundEvent) -> ResponseOutcome {
        let security = plan.event;
        let mut actions = Vec::new();

        match security.level {
            ThreatLevel::Low => actions.push(ResponseAction::RecordedOnly),
            ThreatLevel::Medium => {
                self.delete(&security, &mut actions).await;
                self.timeout(&security, self.policy.timeout_medium_hours, &mut actions)
                    .await;
                self.warn_actor(
                    &security,
                    "Your message was removed for violating server rules. \
                     Repeated violations lead to stronger action.",
                    &mut actions,
                )
                .await;
            }
            ThreatLevel::High => {
                self.delete(&security, &mut actions).await;
                self.timeout(&security, self.policy.timeout_high_hours, &mut actions)
                    .await;
                self.warn_actor(
                    &security,
                    "Your message was removed and your account is under review by moderators.",
                    &mut actions,
                )
                .await;
                self.alert(&security, false, &mut actions).await;
                actions.push(ResponseAction::Quarantined);
            }
            ThreatLevel::Critical | ThreatLevel::Emergency => {
                self.delete(&security, &mut actions).await;
                let reason = format!("automated response: {}", security.reasons.join(", "));
                match self
                    .gateway
                    .ban_member(&security.guild_id, &security.actor_id, &reason)
                    .await
                {
                    Ok(()) => actions.push(ResponseAction::Banned),
                    Err(err) => {
                        warn!(
                            actor = %security.actor_id,
                            error = %err,
                            "ban failed, falling back to extended timeout"
                        );
                        self.timeout(
                            &security,
                            self.policy.ban_fallback_timeout_hours,
                            &mut actions,
                        )
                        .await;
                        if let Some(ResponseAction::TimedOut { hours }) = actions.last().cloned() {
                            actions.pop();
                            actions.push(ResponseAction::BanFallbackTimeout { hours });
                        }
                    }
                }
                self.alert(&security, true, &mut actions).await;
                actions.push(ResponseAction::Quarantined);
            }
        }

        if plan.engage_lockdown {
            match self.gateway.lockdown_guild(&security.guild_id).await {
                Ok(channels) => {
                    info!(guild = %security.guild_id, channels, "emergency lockdown engaged");
                    let alert = ModeratorAlert {
                        guild_id: security.guild_id.clone(),
                        urgent: true,
                        title: "Emergency lockdown engaged".to_string(),
                        lines: vec![
                            format!("{channels} channels restricted"),
                            "Lifting the lockdown requires a moderator action.".to_string(),
                        ],
                    };
                    if let Err(err) = self.alerts.send_alert(&alert).await {
                        warn!(error = %err, "lockdown alert delivery failed");
                    }
                }
                Err(err) => {
                    warn!(guild = %security.guild_id, error = %err, "lockdown engage failed");
                }
            }
        }

        info!(
            event = %security.id,
            level = security.level.as_str(),
            actor = %event.actor_id,
            actions = actions.len(),
            "response applied"
        );

        ResponseOutcome {
            event_id: security.id,
            level: security.level,
            actions,
            deduplicated: false,
            lockdown_engaged: plan.engage_lockdown,
        }
    }

    async fn delete(&self, security: &SecurityEvent, actions: &mut Vec<ResponseAction>) {
        match self
            .gateway
            .delete_message(&security.channel_id, &security.message_id)
            .await
        {
            Ok(()) => actions.push(ResponseAction::MessageDeleted),
            Err(err) => warn!(event = %security.id, error = %err, "message delete failed"),
        }
    }

    async fn timeout(
        &self,
        security: &SecurityEvent,
        hours: i64,
        actions: &mut Vec<ResponseAction>,
    ) {
        let until = security.at + Duration::hours(hours);
        match self
            .gateway
            .timeout_member(&security.guild_id, &security.actor_id, until)
            .await
        {
            Ok(()) => actions.push(ResponseAction::TimedOut { hours }),
            Err(err) => warn!(actor = %security.actor_id, error = %err, "timeout failed"),
        }
    }

    async fn warn_actor(
        &self,
        security: &SecurityEvent,
        message: &str,
        actions: &mut Vec<ResponseAction>,
    ) {
        match self.gateway.dm_actor(&security.actor_id, message).await {
            Ok(()) => actions.push(ResponseAction::WarningSent),
            Err(err) => warn!(actor = %security.actor_id, error = %err, "warning DM failed"),
        }
    }

    async fn alert(
        &self,
        security: &SecurityEvent,
        urgent: bool,
        actions: &mut Vec<ResponseAction>,
    ) {
        let alert = ModeratorAlert {
            guild_id: security.guild_id.clone(),
            urgent,
            title: format!("{} threat detected", security.level.as_str()),
            lines: vec![
                format!("actor: {}", security.actor_id),
                format!("channel: {}", security.channel_id),
                format!("signals: {}", security.reasons.join(", ")),
                format!("snippet: {}", security.snippet),
            ],
        };
        match self.alerts.send_alert(&alert).await {
            Ok(()) => actions.push(ResponseAction::AlertSent { urgent }),
            Err(err) => warn!(event = %security.id, error = %err, "alert delivery failed"),
        }
    }

    /// Cross-event facts fed back into analysis for this actor and guild.
    pub async fn analysis_context(&self, guild_id: &str, actor_id: &str) -> AnalysisContext {
        let state = self.state.lock().await;
        AnalysisContext {
            actor_quarantined: state.quarantined.contains_key(actor_id),
            guild_locked_down: state.lockdowns.contains_key(guild_id),
        }
    }

    pub async fn is_quarantined(&self, actor_id: &str) -> bool {
        self.state.lock().await.quarantined.contains_key(actor_id)
    }

    pub async fn is_locked_down(&self, guild_id: &str) -> bool {
        self.state.lock().await.lockdowns.contains_key(guild_id)
    }

    /// Manually lifts a lockdown. Returns false when the guild was not
    /// locked; the platform is only touched when it was.
    pub async fn lift_lockdown(&self, guild_id: &str) -> Result<bool, GatewayError> {
        let was_locked = self.state.lock().await.lockdowns.remove(guild_id).is_some();
        if !was_locked {
            return Ok(false);
        }
        let channels = self.gateway.lift_lockdown(guild_id).await?;
        info!(guild = %guild_id, channels, "lockdown lifted by operator");
        Ok(true)
    }

    /// Guilds whose lockdown has been quiet long enough to consider lifting.
    /// Detection only: lifting stays a manual operator action.
    pub async fn recovery_candidates(&self, now: DateTime<Utc>) -> Vec<String> {
        let quiet = Duration::seconds(self.policy.recovery_quiet_secs);
        let state = self.state.lock().await;
        state
            .lockdowns
            .iter()
            .filter(|(_, lockdown)| now - lockdown.last_critical_at >= quiet)
            .map(|(guild, _)| guild.clone())
            .collect()
    }

    /// Expires dedupe records and releases aged-out quarantines. Returns
    /// (events expired, quarantines released).
    pub async fn housekeeping_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let retention = Duration::hours(self.policy.event_retention_hours);
        let release = Duration::hours(self.policy.quarantine_release_hours);
        let mut state = self.state.lock().await;

        let events_before = state.seen_events.len();
        state.seen_events.retain(|_, at| now - *at <= retention);
        let expired = events_before - state.seen_events.len();

        // Release requires a clean trailing window: any security event for
        // the actor restarts their quarantine clock.
        let ResponseState {
            quarantined,
            actor_last_event,
            ..
        } = &mut *state;
        let quarantined_before = quarantined.len();
        quarantined.retain(|actor, _| {
            actor_last_event
                .get(actor)
                .is_some_and(|at| now - *at <= release)
        });
        let released = quarantined_before - quarantined.len();
        let last_event_window = std::cmp::max(retention, release);
        actor_last_event.retain(|_, at| now - *at <= last_event_window);

        if expired > 0 || released > 0 {
            info!(expired, released, "response state housekeeping");
        }
        (expired, released)
    }
}
