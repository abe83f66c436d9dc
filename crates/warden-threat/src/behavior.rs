//! Per-actor rolling behavior statistics used by the anomaly detector.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use warden_core::InboundEvent;

/// Fraction of an actor's messages below which an activity hour is
/// considered rare for them.
const RARE_HOUR_SHARE: f64 = 0.05;

/// How many of the actor's most-used words make up their "common
/// vocabulary" for overlap scoring.
const COMMON_VOCABULARY_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct UserBehaviorProfile {
    pub actor_id: String,
    pub message_count: u64,
    pub avg_message_length: f64,
    pub vocabulary: HashMap<String, u32>,
    pub activity_by_hour: [u32; 24],
    pub channels_used: HashSet<String>,
    pub last_seen: DateTime<Utc>,
}

impl UserBehaviorProfile {
    fn new(actor_id: &str, first_seen: DateTime<Utc>) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            message_count: 0,
            avg_message_length: 0.0,
            vocabulary: HashMap::new(),
            activity_by_hour: [0; 24],
            channels_used: HashSet::new(),
            last_seen: first_seen,
        }
    }

    pub fn observe(&mut self, event: &InboundEvent) {
        self.message_count += 1;
        let len = event.content.chars().count() as f64;
        self.avg_message_length += (len - self.avg_message_length) / self.message_count as f64;
        for word in tokenize(&event.content) {
            *self.vocabulary.entry(word).or_default() += 1;
        }
        self.activity_by_hour[event.timestamp.hour() as usize] += 1;
        self.channels_used.insert(event.channel_id.clone());
        self.last_seen = event.timestamp;
    }

    /// Relative deviation of `length` from the running average (2.0 == 200%).
    pub fn length_deviation(&self, length: usize) -> f64 {
        if self.avg_message_length < 1.0 {
            return 0.0;
        }
        (length as f64 - self.avg_message_length).abs() / self.avg_message_length
    }

    /// Share of `words` that appear in this actor's common vocabulary.
    pub fn vocabulary_overlap(&self, words: &HashSet<String>) -> f64 {
        if words.is_empty() {
            return 1.0;
        }
        let common = self.common_words();
        let hits = words.iter().filter(|w| common.contains(w.as_str())).count();
        hits as f64 / words.len() as f64
    }

    pub fn is_rare_hour(&self, hour: u32) -> bool {
        if self.message_count == 0 {
            return false;
        }
        let share = self.activity_by_hour[hour as usize] as f64 / self.message_count as f64;
        share < RARE_HOUR_SHARE
    }

    fn common_words(&self) -> HashSet<&str> {
        let mut ranked: Vec<(&str, u32)> = self
            .vocabulary
            .iter()
            .map(|(word, count)| (word.as_str(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(COMMON_VOCABULARY_SIZE)
            .map(|(word, _)| word)
            .collect()
    }
}

pub fn tokenize(content: &str) -> Vec<String> {
    content
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Lazily-created profiles, evicted after a configured idle period.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, UserBehaviorProfile>,
}

impl ProfileStore {
    pub fn observe(&mut self, event: &InboundEvent) {
        self.profiles
            .entry(event.actor_id.clone())
            .or_insert_with(|| UserBehaviorProfile::new(&event.actor_id, event.timestamp))
            .observe(event);
    }

    pub fn get(&self, actor_id: &str) -> Option<&UserBehaviorProfile> {
        self.profiles.get(actor_id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn evict_inactive(&mut self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let before = self.profiles.len();
        self.profiles
            .retain(|_, profile| now - profile.last_seen <= max_idle);
        before - self.profiles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(actor: &str, content: &str, hour: u32) -> InboundEvent {
        InboundEvent {
            guild_id: "g".to_string(),
            channel_id: "c".to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor.to_string(),
            actor_name: actor.to_string(),
            actor_created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            content: content.to_string(),
            mention_count: 0,
            mentions_bot: false,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn running_average_tracks_message_length() {
        let mut store = ProfileStore::default();
        store.observe(&event("a", "aaaa", 12)); // len 4
        store.observe(&event("a", "aaaaaaaa", 12)); // len 8
        let profile = store.get("a").expect("profile");
        assert_eq!(profile.message_count, 2);
        assert!((profile.avg_message_length - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rare_hour_requires_history() {
        let mut store = ProfileStore::default();
        for _ in 0..30 {
            store.observe(&event("a", "hello there", 12));
        }
        let profile = store.get("a").expect("profile");
        assert!(profile.is_rare_hour(3));
        assert!(!profile.is_rare_hour(12));
    }

    #[test]
    fn vocabulary_overlap_distinguishes_known_words() {
        let mut store = ProfileStore::default();
        for _ in 0..10 {
            store.observe(&event("a", "good morning friends", 12));
        }
        let profile = store.get("a").expect("profile");
        let known: HashSet<String> = tokenize("good morning").into_iter().collect();
        let unknown: HashSet<String> = tokenize("buy cheap tokens").into_iter().collect();
        assert!(profile.vocabulary_overlap(&known) > 0.9);
        assert!(profile.vocabulary_overlap(&unknown) < 0.1);
    }

    #[test]
    fn eviction_removes_idle_profiles() {
        let mut store = ProfileStore::default();
        store.observe(&event("idle", "hello", 12));
        store.observe(&event("busy", "hello", 12));
        let later = Utc.with_ymd_and_hms(2024, 6, 9, 12, 0, 0).unwrap();
        store.observe(&InboundEvent {
            timestamp: later,
            ..event("busy", "hello again", 12)
        });
        let evicted = store.evict_inactive(later, Duration::days(7));
        assert_eq!(evicted, 1);
        assert!(store.get("idle").is_none());
        assert!(store.get("busy").is_some());
    }
}
