//! Multi-signal threat analysis for inbound chat messages.
//!
//! `evaluate` is a pure function of the message and the engine's current
//! state; `record` folds the message into that state afterwards. Keeping the
//! two separate is what makes analysis deterministic and repeatable.

pub mod behavior;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Timelike, Utc};
use url::Url;
use warden_common::ThreatThresholds;
use warden_core::{InboundEvent, MemberJoinEvent};

pub use behavior::{ProfileStore, UserBehaviorProfile};
use behavior::tokenize;

pub mod signals {
    pub const PHISHING: &str = "phishing";
    pub const MALICIOUS_LINK: &str = "malicious_link";
    pub const SOCIAL_ENGINEERING: &str = "social_engineering";
    pub const SPAM: &str = "spam";
    pub const MASS_MENTION: &str = "mass_mention";
    pub const RAID_PATTERN: &str = "raid_pattern";
    pub const BEHAVIOR_ANOMALY: &str = "behavior_anomaly";
    pub const CREDENTIAL_THEFT: &str = "credential_theft";
    pub const DISRUPTION: &str = "disruption";
}

// Signal categories for the escalation rule. Phishing and malicious links
// almost always co-occur on the same scam message, so they count as one
// independent category; likewise spam volume and mass mentions.
fn signal_category(tag: &str) -> &'static str {
    match tag {
        signals::PHISHING | signals::MALICIOUS_LINK => "scam",
        signals::SPAM | signals::MASS_MENTION => "spam",
        signals::SOCIAL_ENGINEERING => "social",
        signals::RAID_PATTERN => "raid",
        signals::BEHAVIOR_ANOMALY => "anomaly",
        signals::CREDENTIAL_THEFT => "credential",
        _ => "disruption",
    }
}

const URGENCY_KEYWORDS: &[&str] = &[
    "urgent",
    "immediately",
    "right now",
    "limited time",
    "act now",
    "expires",
    "last chance",
];
const LURE_KEYWORDS: &[&str] = &[
    "free nitro",
    "free discord nitro",
    "you won",
    "you've won",
    "claim your",
    "giveaway",
    "gift for you",
];
const VERIFICATION_KEYWORDS: &[&str] = &[
    "verify your account",
    "confirm your identity",
    "account suspended",
    "unusual activity",
    "validate your",
];

const URL_SHORTENERS: &[&str] = &[
    "bit.ly",
    "tinyurl.com",
    "goo.gl",
    "t.co",
    "is.gd",
    "cutt.ly",
    "rb.gy",
    "shorturl.at",
];
const SUSPICIOUS_HOST_FRAGMENTS: &[&str] = &[
    "discord-nitro",
    "discordgift",
    "free-nitro",
    "dlscord",
    "discrod",
    "steamcommunlty",
];
const PLATFORM_HOSTS: &[&str] = &["discord.com", "discord.gg", "discordapp.com", "discord.media"];

const AUTHORITY_KEYWORDS: &[&str] = &[
    "i'm a moderator",
    "i am a moderator",
    "i'm an admin",
    "i am an admin",
    "official staff",
    "discord staff",
    "server admin",
    "support team",
];
const INFO_REQUEST_KEYWORDS: &[&str] = &[
    "what is your",
    "tell me your",
    "i need your",
    "your password",
    "your email",
    "your date of birth",
];

const CREDENTIAL_KEYWORDS: &[&str] = &[
    "token",
    "password",
    "2fa",
    "authenticator",
    "backup code",
    "credential",
    "login code",
];
const REQUEST_PHRASES: &[&str] = &["send me", "share your", "give me", "dm me", "post your"];

const DISRUPTION_PHRASES: &[&str] = &[
    "let's raid",
    "raid this",
    "raid the server",
    "flood the",
    "crash the",
    "spam the",
    "nuke the",
];
const MASS_PING_EMOJI: &[&str] = &["\u{1F4E2}", "\u{1F50A}", "\u{203C}\u{FE0F}"];
const MASS_PING_TARGETS: &[&str] = &["everyone", "all", "mass"];

const FINGERPRINT_PREFIX_CHARS: usize = 10;
const FINGERPRINT_TTL_HOURS: i64 = 1;
const JOIN_BURST_WINDOW_SECS: i64 = 300;
const JOIN_BURST_MIN: usize = 3;

/// Ordinal severity scale. Only ever computed fresh per analysis; signals
/// combine via `max()` plus the escalation bumps in [`ThreatEngine::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreatLevel {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
    Emergency = 5,
}

impl ThreatLevel {
    /// One step up the ladder, saturating at the top of the scale.
    pub fn bump(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High => Self::Critical,
            Self::Critical | Self::Emergency => Self::Emergency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatAssessment {
    pub level: ThreatLevel,
    pub reasons: Vec<&'static str>,
}

/// Cross-event facts supplied by the response layer. Quarantine lowers the
/// effective escalation threshold for an actor's future messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisContext {
    pub actor_quarantined: bool,
    pub guild_locked_down: bool,
}

#[derive(Debug)]
struct ChannelMessage {
    words: HashSet<String>,
    at: DateTime<Utc>,
}

#[derive(Debug)]
struct FingerprintStat {
    count: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct GuildPost {
    account_created_at: DateTime<Utc>,
    prefix: String,
    at: DateTime<Utc>,
}

pub struct ThreatEngine {
    thresholds: ThreatThresholds,
    profiles: ProfileStore,
    channel_history: HashMap<String, VecDeque<ChannelMessage>>,
    actor_frequency: HashMap<String, VecDeque<DateTime<Utc>>>,
    fingerprints: HashMap<String, FingerprintStat>,
    guild_recent: HashMap<String, VecDeque<GuildPost>>,
    guild_joins: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl ThreatEngine {
    pub fn new(thresholds: ThreatThresholds) -> Self {
        Self {
            thresholds,
            profiles: ProfileStore::default(),
            channel_history: HashMap::new(),
            actor_frequency: HashMap::new(),
            fingerprints: HashMap::new(),
            guild_recent: HashMap::new(),
            guild_joins: HashMap::new(),
        }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Runs the full detector battery against the current state. Pure: two
    /// calls with the same message and unchanged state yield the same
    /// assessment.
    pub fn evaluate(&self, event: &InboundEvent, ctx: &AnalysisContext) -> ThreatAssessment {
        let t = &self.thresholds;
        let content = event.content.to_lowercase();
        let mut level = ThreatLevel::Low;
        let mut reasons: Vec<&'static str> = Vec::new();

        if phishing_score(&content) >= t.phishing_score_min {
            raise(&mut level, ThreatLevel::High);
            reasons.push(signals::PHISHING);
        }
        if has_malicious_link(&content) {
            raise(&mut level, ThreatLevel::High);
            reasons.push(signals::MALICIOUS_LINK);
        }
        if social_score(&content) > t.social_score_over {
            raise(&mut level, ThreatLevel::Medium);
            reasons.push(signals::SOCIAL_ENGINEERING);
        }
        if self.spam_score(event, &content) > t.spam_score_over {
            raise(&mut level, ThreatLevel::Medium);
            reasons.push(signals::SPAM);
        }
        if event.mention_count >= t.mass_mention_min {
            raise(&mut level, ThreatLevel::High);
            reasons.push(signals::MASS_MENTION);
        }
        if self.raid_triggered(event) {
            raise(&mut level, ThreatLevel::Critical);
            reasons.push(signals::RAID_PATTERN);
        }
        if self.anomaly_score(event, &content) > t.anomaly_score_over {
            raise(&mut level, ThreatLevel::Medium);
            reasons.push(signals::BEHAVIOR_ANOMALY);
        }
        if credential_theft(&content, t.credential_keyword_min) {
            raise(&mut level, ThreatLevel::Critical);
            reasons.push(signals::CREDENTIAL_THEFT);
        }
        if disruption(&content) {
            raise(&mut level, ThreatLevel::High);
            reasons.push(signals::DISRUPTION);
        }

        let categories: HashSet<&str> = reasons.iter().map(|tag| signal_category(tag)).collect();
        if categories.len() >= t.escalation_signal_min {
            level = level.bump();
        }
        if self.temporal_risk(event) + self.context_risk(event, ctx) > t.combined_risk_over {
            level = level.bump();
        }

        ThreatAssessment { level, reasons }
    }

    /// Folds a handled message into the rolling state. Called exactly once
    /// per message, after `evaluate`.
    pub fn record(&mut self, event: &InboundEvent) {
        self.profiles.observe(event);

        let words: HashSet<String> = tokenize(&event.content).into_iter().collect();
        let history_cap = self.thresholds.channel_history_len;
        let history = self
            .channel_history
            .entry(event.channel_id.clone())
            .or_default();
        history.push_back(ChannelMessage {
            words,
            at: event.timestamp,
        });
        while history.len() > history_cap {
            history.pop_front();
        }

        let freq_window = Duration::seconds(self.thresholds.spam_frequency_window_secs);
        let freq = self
            .actor_frequency
            .entry(event.actor_id.clone())
            .or_default();
        freq.push_back(event.timestamp);
        while freq
            .front()
            .is_some_and(|at| event.timestamp - *at > freq_window)
        {
            freq.pop_front();
        }

        let stat = self
            .fingerprints
            .entry(fingerprint_key(event))
            .or_insert(FingerprintStat {
                count: 0,
                last_seen: event.timestamp,
            });
        stat.count += 1;
        stat.last_seen = event.timestamp;

        let raid_window = Duration::seconds(self.thresholds.raid_window_secs);
        let recent = self.guild_recent.entry(event.guild_id.clone()).or_default();
        recent.push_back(GuildPost {
            account_created_at: event.actor_created_at,
            prefix: prefix(&event.content, self.thresholds.raid_prefix_len),
            at: event.timestamp,
        });
        while recent
            .front()
            .is_some_and(|post| event.timestamp - post.at > raid_window)
        {
            recent.pop_front();
        }
    }

    pub fn record_member_join(&mut self, join: &MemberJoinEvent) {
        let joins = self.guild_joins.entry(join.guild_id.clone()).or_default();
        joins.push_back(join.joined_at);
        while joins
            .front()
            .is_some_and(|at| join.joined_at - *at > Duration::seconds(JOIN_BURST_WINDOW_SECS))
        {
            joins.pop_front();
        }
    }

    /// Periodic state pruning; returns the number of evicted profiles.
    pub fn housekeeping(&mut self, now: DateTime<Utc>, profile_max_idle: Duration) -> usize {
        let fingerprint_ttl = Duration::hours(FINGERPRINT_TTL_HOURS);
        self.fingerprints
            .retain(|_, stat| now - stat.last_seen <= fingerprint_ttl);

        let freq_window = Duration::seconds(self.thresholds.spam_frequency_window_secs);
        self.actor_frequency.retain(|_, entries| {
            while entries.front().is_some_and(|at| now - *at > freq_window) {
                entries.pop_front();
            }
            !entries.is_empty()
        });

        let raid_window = Duration::seconds(self.thresholds.raid_window_secs);
        self.guild_recent.retain(|_, posts| {
            while posts.front().is_some_and(|post| now - post.at > raid_window) {
                posts.pop_front();
            }
            !posts.is_empty()
        });

        let join_window = Duration::seconds(JOIN_BURST_WINDOW_SECS);
        self.guild_joins.retain(|_, joins| {
            while joins.front().is_some_and(|at| now - *at > join_window) {
                joins.pop_front();
            }
            !joins.is_empty()
        });

        let stale_history = Duration::hours(1);
        self.channel_history.retain(|_, messages| {
            while messages
                .front()
                .is_some_and(|msg| now - msg.at > stale_history)
            {
                messages.pop_front();
            }
            !messages.is_empty()
        });

        self.profiles.evict_inactive(now, profile_max_idle)
    }

    fn spam_score(&self, event: &InboundEvent, content: &str) -> u32 {
        let t = &self.thresholds;
        let mut score = 0;

        let freq_window = Duration::seconds(t.spam_frequency_window_secs);
        let recent = self
            .actor_frequency
            .get(&event.actor_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|at| event.timestamp - **at <= freq_window)
                    .count() as u32
            })
            .unwrap_or(0);
        if recent + 1 > t.spam_frequency_over {
            score += 5;
        }

        let words: HashSet<String> = tokenize(content).into_iter().collect();
        if let Some(history) = self.channel_history.get(&event.channel_id)
            && history
                .iter()
                .any(|msg| jaccard(&words, &msg.words) > t.spam_similarity_min)
        {
            score += 3;
        }

        let seen = self
            .fingerprints
            .get(&fingerprint_key(event))
            .map(|stat| stat.count)
            .unwrap_or(0);
        if seen + 1 > t.spam_fingerprint_over {
            score += 4;
        }

        score
    }

    fn raid_triggered(&self, event: &InboundEvent) -> bool {
        let t = &self.thresholds;
        let window = Duration::seconds(t.raid_window_secs);
        let young = Duration::seconds(t.raid_young_account_secs);
        let current_prefix = prefix(&event.content, t.raid_prefix_len);

        let mut young_count: u32 = u32::from(event.timestamp - event.actor_created_at < young);
        let mut prefix_count: u32 = 1;
        if let Some(posts) = self.guild_recent.get(&event.guild_id) {
            for post in posts.iter().filter(|p| event.timestamp - p.at <= window) {
                if post.at - post.account_created_at < young {
                    young_count += 1;
                }
                if !current_prefix.is_empty() && post.prefix == current_prefix {
                    prefix_count += 1;
                }
            }
        }

        young_count >= t.raid_young_message_min || prefix_count > t.raid_prefix_over
    }

    fn anomaly_score(&self, event: &InboundEvent, content: &str) -> f64 {
        let t = &self.thresholds;
        let Some(profile) = self.profiles.get(&event.actor_id) else {
            return 0.0;
        };
        if profile.message_count < t.anomaly_min_history {
            return 0.0;
        }

        let mut score: f64 = 0.0;
        if profile.length_deviation(event.content.chars().count()) > t.anomaly_length_deviation {
            score += 0.4;
        }
        let words: HashSet<String> = tokenize(content).into_iter().collect();
        if profile.vocabulary_overlap(&words) < t.anomaly_vocab_overlap_min {
            score += 0.35;
        }
        if profile.is_rare_hour(event.timestamp.hour()) {
            score += 0.3;
        }
        score.min(1.0)
    }

    fn temporal_risk(&self, event: &InboundEvent) -> f64 {
        let mut risk: f64 = 0.0;
        let account_age = event.timestamp - event.actor_created_at;
        if account_age < Duration::hours(1) {
            risk += 0.3;
        } else if account_age < Duration::hours(24) {
            risk += 0.15;
        }
        if let Some(profile) = self.profiles.get(&event.actor_id)
            && profile.message_count >= self.thresholds.anomaly_min_history
            && profile.is_rare_hour(event.timestamp.hour())
        {
            risk += 0.1;
        }
        if let Some(joins) = self.guild_joins.get(&event.guild_id) {
            let burst = joins
                .iter()
                .filter(|at| event.timestamp - **at <= Duration::seconds(JOIN_BURST_WINDOW_SECS))
                .count();
            if burst >= JOIN_BURST_MIN {
                risk += 0.2;
            }
        }
        risk.min(1.0)
    }

    fn context_risk(&self, event: &InboundEvent, ctx: &AnalysisContext) -> f64 {
        let mut risk: f64 = 0.0;
        if ctx.actor_quarantined {
            risk += 0.4;
        }
        if ctx.guild_locked_down {
            risk += 0.2;
        }
        if event.mention_count >= 3 {
            risk += 0.1;
        }
        risk.min(1.0)
    }
}

fn raise(level: &mut ThreatLevel, candidate: ThreatLevel) {
    if candidate > *level {
        *level = candidate;
    }
}

fn phishing_score(content: &str) -> u32 {
    let mut score = 0;
    score += URGENCY_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    score += 2 * LURE_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    score += 2 * VERIFICATION_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    score
}

fn has_malicious_link(content: &str) -> bool {
    content
        .split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .filter_map(|token| Url::parse(token.trim_end_matches([',', '.', '!', ')'])).ok())
        .any(|url| {
            let Some(host) = url.host_str() else {
                return false;
            };
            if URL_SHORTENERS.iter().any(|s| host == *s) {
                return true;
            }
            if SUSPICIOUS_HOST_FRAGMENTS.iter().any(|f| host.contains(f)) {
                return true;
            }
            // Platform impersonation: the brand name in a host that is not
            // one of the real platform domains.
            host.contains("discord")
                && !PLATFORM_HOSTS
                    .iter()
                    .any(|legit| host == *legit || host.ends_with(&format!(".{legit}")))
        })
}

fn social_score(content: &str) -> u32 {
    let mut score = 0;
    score += 2 * AUTHORITY_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    score += INFO_REQUEST_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    score
}

fn credential_theft(content: &str, keyword_min: u32) -> bool {
    let keyword_hits = CREDENTIAL_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count() as u32;
    keyword_hits >= keyword_min && REQUEST_PHRASES.iter().any(|p| content.contains(*p))
}

fn disruption(content: &str) -> bool {
    if DISRUPTION_PHRASES.iter().any(|p| content.contains(*p)) {
        return true;
    }
    MASS_PING_EMOJI.iter().any(|e| content.contains(*e))
        && MASS_PING_TARGETS.iter().any(|t| {
            tokenize(content)
                .iter()
                .any(|word| word == t)
        })
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

fn fingerprint_key(event: &InboundEvent) -> String {
    format!(
        "{}:{}:{}",
        event.actor_id,
        event.content.chars().count(),
        prefix(&event.content, FINGERPRINT_PREFIX_CHARS)
    )
}

fn prefix(content: &str, chars: usize) -> String {
    content.to_lowercase().chars().take(chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn old_account() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn event(actor: &str, content: &str) -> InboundEvent {
        InboundEvent {
            guild_id: "guild-1".to_string(),
            channel_id: "channel-1".to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor.to_string(),
            actor_name: actor.to_string(),
            actor_created_at: old_account(),
            content: content.to_string(),
            mention_count: 0,
            mentions_bot: false,
            timestamp: noon(),
        }
    }

    fn engine() -> ThreatEngine {
        ThreatEngine::new(ThreatThresholds::default())
    }

    const NITRO_SCAM: &str =
        "Free Discord Nitro! Click here to verify your account now, limited time! https://bit.ly/xyz";

    #[test]
    fn nitro_scam_with_shortener_is_high() {
        let engine = engine();
        let assessment = engine.evaluate(&event("scammer", NITRO_SCAM), &AnalysisContext::default());
        assert_eq!(assessment.level, ThreatLevel::High);
        assert!(assessment.reasons.contains(&signals::PHISHING));
        assert!(assessment.reasons.contains(&signals::MALICIOUS_LINK));
    }

    #[test]
    fn evaluate_is_pure_given_unchanged_state() {
        let engine = engine();
        let msg = event("scammer", NITRO_SCAM);
        let ctx = AnalysisContext::default();
        assert_eq!(engine.evaluate(&msg, &ctx), engine.evaluate(&msg, &ctx));
    }

    #[test]
    fn impersonation_host_is_flagged() {
        let engine = engine();
        let assessment = engine.evaluate(
            &event("scammer", "check this https://discord-gifts.example.com/claim right?"),
            &AnalysisContext::default(),
        );
        assert!(assessment.reasons.contains(&signals::MALICIOUS_LINK));
    }

    #[test]
    fn real_platform_hosts_are_not_flagged() {
        let engine = engine();
        let assessment = engine.evaluate(
            &event("friend", "join us at https://discord.gg/rustlang"),
            &AnalysisContext::default(),
        );
        assert!(!assessment.reasons.contains(&signals::MALICIOUS_LINK));
    }

    #[test]
    fn credential_request_is_critical() {
        let engine = engine();
        let assessment = engine.evaluate(
            &event("thief", "hey can you send me your token and password real quick"),
            &AnalysisContext::default(),
        );
        assert_eq!(assessment.level, ThreatLevel::Critical);
        assert!(assessment.reasons.contains(&signals::CREDENTIAL_THEFT));
    }

    #[test]
    fn mass_mention_is_high() {
        let engine = engine();
        let mut msg = event("pinger", "everyone look at this");
        msg.mention_count = 6;
        let assessment = engine.evaluate(&msg, &AnalysisContext::default());
        assert_eq!(assessment.level, ThreatLevel::High);
        assert!(assessment.reasons.contains(&signals::MASS_MENTION));
    }

    #[test]
    fn young_account_burst_is_critical_raid() {
        let mut engine = engine();
        let base = noon();
        for i in 0..4 {
            let mut msg = event(&format!("fresh-{i}"), "join our server for prizes");
            msg.actor_created_at = base - Duration::seconds(60);
            msg.timestamp = base + Duration::seconds(i * 20);
            engine.record(&msg);
        }
        let mut trigger = event("fresh-4", "join our server for prizes");
        trigger.actor_created_at = base - Duration::seconds(60);
        trigger.timestamp = base + Duration::seconds(90);
        let assessment = engine.evaluate(&trigger, &AnalysisContext::default());
        assert_eq!(assessment.level, ThreatLevel::Critical);
        assert!(assessment.reasons.contains(&signals::RAID_PATTERN));
    }

    #[test]
    fn repeated_prefix_guild_wide_is_raid() {
        let mut engine = engine();
        let copypasta = "THIS SERVER WILL BE DELETED TOMORROW unless you all move to the new one";
        for i in 0..3 {
            let mut msg = event(&format!("mule-{i}"), copypasta);
            msg.timestamp = noon() + Duration::seconds(i * 10);
            engine.record(&msg);
        }
        let mut trigger = event("mule-3", copypasta);
        trigger.timestamp = noon() + Duration::seconds(40);
        let assessment = engine.evaluate(&trigger, &AnalysisContext::default());
        assert!(assessment.reasons.contains(&signals::RAID_PATTERN));
        assert!(assessment.level >= ThreatLevel::Critical);
    }

    #[test]
    fn message_flood_scores_as_spam() {
        let mut engine = engine();
        // Leading counter keeps message prefixes distinct so only the spam
        // detector fires, not the raid prefix check.
        for i in 0..9 {
            let mut msg = event(
                "flooder",
                &format!("{i} buy cheap followers and likes for your page today friend"),
            );
            msg.timestamp = noon() + Duration::seconds(i * 5);
            engine.record(&msg);
        }
        let mut trigger = event(
            "flooder",
            "buy cheap followers and likes for your page today friend",
        );
        trigger.timestamp = noon() + Duration::seconds(50);
        let assessment = engine.evaluate(&trigger, &AnalysisContext::default());
        assert_eq!(assessment.level, ThreatLevel::Medium);
        assert_eq!(assessment.reasons, vec![signals::SPAM]);
    }

    #[test]
    fn anomalous_message_against_established_profile_is_medium() {
        let mut engine = engine();
        for i in 0..12 {
            let mut msg = event("regular", "good morning friends have a lovely day");
            msg.timestamp = noon() + Duration::minutes(i);
            engine.record(&msg);
        }
        let mut odd = event(
            "regular",
            "zebra quantum harvest velvet orbit thunder quartz ember salmon drift canyon marble \
             sprocket lantern tundra bramble cascade pylon griffin meadow",
        );
        odd.timestamp = Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap();
        let assessment = engine.evaluate(&odd, &AnalysisContext::default());
        assert_eq!(assessment.level, ThreatLevel::Medium);
        assert!(assessment.reasons.contains(&signals::BEHAVIOR_ANOMALY));
    }

    #[test]
    fn two_signal_categories_bump_one_step() {
        let engine = engine();
        let assessment = engine.evaluate(
            &event(
                "scammer",
                "Free Discord Nitro! verify your account now, limited time! then flood the server",
            ),
            &AnalysisContext::default(),
        );
        assert!(assessment.reasons.contains(&signals::PHISHING));
        assert!(assessment.reasons.contains(&signals::DISRUPTION));
        assert_eq!(assessment.level, ThreatLevel::Critical);
    }

    #[test]
    fn stacked_bumps_saturate_at_emergency() {
        let mut engine = engine();
        let base = noon();
        for i in 0..4 {
            let mut msg = event(&format!("fresh-{i}"), "send tokens here");
            msg.actor_created_at = base - Duration::seconds(60);
            msg.timestamp = base + Duration::seconds(i * 10);
            engine.record(&msg);
        }
        let mut trigger = event("fresh-4", "send me your token and password and 2fa code");
        trigger.actor_created_at = base - Duration::seconds(60);
        trigger.timestamp = base + Duration::seconds(50);
        let assessment = engine.evaluate(
            &trigger,
            &AnalysisContext {
                actor_quarantined: true,
                guild_locked_down: false,
            },
        );
        // credential theft + raid pattern (two categories) plus combined
        // risk over the line: Critical -> Emergency, then saturation.
        assert_eq!(assessment.level, ThreatLevel::Emergency);
    }

    #[test]
    fn combined_risk_alone_bumps_low_to_medium() {
        let engine = engine();
        let mut msg = event("newcomer", "hello there friend");
        msg.actor_created_at = noon() - Duration::minutes(30);
        let assessment = engine.evaluate(
            &msg,
            &AnalysisContext {
                actor_quarantined: true,
                guild_locked_down: false,
            },
        );
        assert!(assessment.reasons.is_empty());
        assert_eq!(assessment.level, ThreatLevel::Medium);
    }

    #[test]
    fn raising_a_threshold_never_raises_the_level() {
        let strict = ThreatEngine::new(ThreatThresholds {
            phishing_score_min: 100,
            ..ThreatThresholds::default()
        });
        let default = engine();
        let msg = event("scammer", NITRO_SCAM);
        let ctx = AnalysisContext::default();
        let strict_result = strict.evaluate(&msg, &ctx);
        let default_result = default.evaluate(&msg, &ctx);
        assert!(!strict_result.reasons.contains(&signals::PHISHING));
        assert!(strict_result.level <= default_result.level);
    }

    #[test]
    fn housekeeping_evicts_stale_profiles_and_windows() {
        let mut engine = engine();
        engine.record(&event("actor", "hello everyone in chat"));
        assert_eq!(engine.profiles().len(), 1);
        let later = noon() + Duration::days(8);
        let evicted = engine.housekeeping(later, Duration::days(7));
        assert_eq!(evicted, 1);
        assert!(engine.actor_frequency.is_empty());
        assert!(engine.guild_recent.is_empty());
        assert!(engine.channel_history.is_empty());
    }
}
