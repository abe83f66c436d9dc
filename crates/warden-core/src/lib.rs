use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use warden_common::{ClassifierConfig, RateLimitConfig};

/// Task type keys understood by the dispatch registry. External feature
/// modules may register additional keys.
pub mod task_types {
    pub const SECURITY_CHECK: &str = "security_check";
    pub const AI_RESPONSE: &str = "ai_response";
    pub const SUPPORT_RESPONSE: &str = "support_response";
    pub const CONVERSATION: &str = "conversation";
    pub const ANALYTICS: &str = "analytics";
}

/// Dispatch priority. Declaration order matters: `Ord` derives ascending,
/// so `Critical < High < Normal < Low` and the lowest value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// A decoded message event from the chat-platform gateway. The pipeline
/// never sees wire bytes; the gateway adapter produces these.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_created_at: DateTime<Utc>,
    pub content: String,
    pub mention_count: u32,
    pub mentions_bot: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MemberJoinEvent {
    pub guild_id: String,
    pub actor_id: String,
    pub actor_created_at: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TaskPayload {
    Message(InboundEvent),
    MemberJoin(MemberJoinEvent),
}

impl TaskPayload {
    pub fn message(&self) -> Option<&InboundEvent> {
        match self {
            Self::Message(event) => Some(event),
            Self::MemberJoin(_) => None,
        }
    }
}

/// One unit of triage work derived from a single inbound event. Consumed
/// and discarded by the worker pool; never persisted.
#[derive(Debug, Clone)]
pub struct MessageTask {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub retry_count: u8,
    pub max_retries: u8,
}

impl MessageTask {
    pub fn new(task_type: &str, priority: Priority, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            priority,
            payload,
            // Retry budget is carried for forward compatibility; the
            // scheduler does not auto-increment it on failure.
            retry_count: 0,
            max_retries: 3,
        }
    }
}

/// Per-actor sliding-window admission control. One actor saturating its
/// budget never affects another actor's window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_admissions: usize,
    admissions: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs),
            max_admissions: cfg.max_admissions as usize,
            admissions: HashMap::new(),
        }
    }

    pub fn admit(&mut self, actor_id: &str) -> bool {
        self.admit_at(actor_id, Instant::now())
    }

    pub fn admit_at(&mut self, actor_id: &str, now: Instant) -> bool {
        let window = self.window;
        let entries = self.admissions.entry(actor_id.to_string()).or_default();
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= self.max_admissions {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Drops actors whose entire window has expired. Run from housekeeping,
    /// not per admission.
    pub fn prune_idle(&mut self, now: Instant) {
        let window = self.window;
        self.admissions.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
    }

    pub fn tracked_actors(&self) -> usize {
        self.admissions.len()
    }
}

/// Pure, side-effect-free triage of an admitted event into prioritized
/// tasks. A single message may yield several tasks; rejected events must
/// never reach this point.
#[derive(Debug, Clone)]
pub struct IngestClassifier {
    cfg: ClassifierConfig,
}

impl IngestClassifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self { cfg }
    }

    pub fn classify(&self, event: &InboundEvent) -> Vec<MessageTask> {
        let mut tasks = Vec::new();
        let content = event.content.to_lowercase();

        if self
            .cfg
            .violation_keywords
            .iter()
            .any(|kw| content.contains(kw.as_str()))
        {
            tasks.push(MessageTask::new(
                task_types::SECURITY_CHECK,
                Priority::Critical,
                TaskPayload::Message(event.clone()),
            ));
        }

        let wants_reply = event.mentions_bot
            || content.contains('?')
            || content.contains(self.cfg.wake_word.as_str());
        if wants_reply {
            tasks.push(MessageTask::new(
                task_types::AI_RESPONSE,
                Priority::High,
                TaskPayload::Message(event.clone()),
            ));
        }

        if self
            .cfg
            .support_keywords
            .iter()
            .any(|kw| content.contains(kw.as_str()))
        {
            tasks.push(MessageTask::new(
                task_types::SUPPORT_RESPONSE,
                Priority::High,
                TaskPayload::Message(event.clone()),
            ));
        }

        if !wants_reply && event.content.len() > self.cfg.min_conversation_len {
            tasks.push(MessageTask::new(
                task_types::CONVERSATION,
                Priority::Normal,
                TaskPayload::Message(event.clone()),
            ));
        }

        tasks.push(MessageTask::new(
            task_types::ANALYTICS,
            Priority::Low,
            TaskPayload::Message(event.clone()),
        ));

        tasks
    }

    pub fn classify_member_join(&self, join: &MemberJoinEvent) -> Vec<MessageTask> {
        vec![MessageTask::new(
            task_types::ANALYTICS,
            Priority::Low,
            TaskPayload::MemberJoin(join.clone()),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn test_event(actor_id: &str, content: &str) -> InboundEvent {
        InboundEvent {
            guild_id: "guild-1".to_string(),
            channel_id: "channel-1".to_string(),
            message_id: Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            actor_name: actor_id.to_string(),
            actor_created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            content: content.to_string(),
            mention_count: 0,
            mentions_bot: false,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn classifier() -> IngestClassifier {
        IngestClassifier::new(ClassifierConfig::default())
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn limiter_rejects_sixth_admission_in_window() {
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        let start = Instant::now();
        for i in 0..5 {
            assert!(limiter.admit_at("actor", start + Duration::from_secs(i)));
        }
        assert!(!limiter.admit_at("actor", start + Duration::from_secs(8)));
    }

    #[test]
    fn limiter_readmits_after_window_expiry() {
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.admit_at("actor", start));
        }
        assert!(!limiter.admit_at("actor", start + Duration::from_secs(9)));
        assert!(limiter.admit_at("actor", start + Duration::from_secs(10)));
    }

    #[test]
    fn limiter_isolates_actors() {
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.admit_at("noisy", start));
        }
        assert!(!limiter.admit_at("noisy", start));
        assert!(limiter.admit_at("quiet", start));
    }

    #[test]
    fn limiter_prunes_idle_actors() {
        let mut limiter = RateLimiter::new(&RateLimitConfig::default());
        let start = Instant::now();
        limiter.admit_at("actor", start);
        assert_eq!(limiter.tracked_actors(), 1);
        limiter.prune_idle(start + Duration::from_secs(11));
        assert_eq!(limiter.tracked_actors(), 0);
    }

    #[test]
    fn violation_content_emits_critical_security_check() {
        let tasks = classifier().classify(&test_event("a", "Free nitro https://bit.ly/x"));
        let security = tasks
            .iter()
            .find(|t| t.task_type == task_types::SECURITY_CHECK)
            .expect("security task");
        assert_eq!(security.priority, Priority::Critical);
    }

    #[test]
    fn question_emits_ai_response_and_suppresses_conversation() {
        let tasks = classifier().classify(&test_event("a", "does anyone know how this works?"));
        assert!(tasks.iter().any(|t| t.task_type == task_types::AI_RESPONSE));
        assert!(
            !tasks
                .iter()
                .any(|t| t.task_type == task_types::CONVERSATION)
        );
    }

    #[test]
    fn long_plain_message_emits_conversation() {
        let tasks = classifier().classify(&test_event("a", "just hanging out in the lobby today"));
        assert!(
            tasks
                .iter()
                .any(|t| t.task_type == task_types::CONVERSATION && t.priority == Priority::Normal)
        );
    }

    #[test]
    fn every_message_emits_analytics() {
        let tasks = classifier().classify(&test_event("a", "hi"));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, task_types::ANALYTICS);
        assert_eq!(tasks[0].priority, Priority::Low);
    }

    #[test]
    fn support_keyword_emits_support_response() {
        let tasks = classifier().classify(&test_event("a", "getting an error on login"));
        assert!(
            tasks
                .iter()
                .any(|t| t.task_type == task_types::SUPPORT_RESPONSE && t.priority == Priority::High)
        );
    }

    #[test]
    fn member_join_emits_analytics_only() {
        let join = MemberJoinEvent {
            guild_id: "guild-1".to_string(),
            actor_id: "new".to_string(),
            actor_created_at: Utc.with_ymd_and_hms(2024, 6, 1, 11, 59, 0).unwrap(),
            joined_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        };
        let tasks = classifier().classify_member_join(&join);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, task_types::ANALYTICS);
    }
}
