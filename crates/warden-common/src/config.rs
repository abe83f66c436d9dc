use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = ".warden/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    pub log_level: String,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub threat: ThreatThresholds,
    #[serde(default)]
    pub response: ResponsePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Environment variable holding the bot token. The token itself never
    /// lives in the config file.
    pub token_env: String,
    pub bot_user_id: Option<String>,
    pub alert_channel_id: Option<String>,
    pub moderator_role_id: Option<String>,
    pub watch_channels: Vec<String>,
    pub poll_interval_ms: u64,
    pub api_timeout_ms: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token_env: "DISCORD_BOT_TOKEN".to_string(),
            bot_user_id: None,
            alert_channel_id: None,
            moderator_role_id: None,
            watch_channels: Vec::new(),
            poll_interval_ms: 2_000,
            api_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_admissions: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            max_admissions: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub queue_capacity: usize,
    pub worker_ceiling: usize,
    pub task_timeout_ms: u64,
    pub dispatch_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            worker_ceiling: 50,
            task_timeout_ms: 30_000,
            dispatch_backoff_ms: 25,
            shutdown_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub wake_word: String,
    pub violation_keywords: Vec<String>,
    pub support_keywords: Vec<String>,
    pub min_conversation_len: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            wake_word: "warden".to_string(),
            violation_keywords: [
                "free nitro",
                "free discord nitro",
                "verify your account",
                "claim your prize",
                "http://",
                "https://",
                "@everyone",
            ]
            .iter()
            .map(|v| (*v).to_string())
            .collect(),
            support_keywords: ["help", "error", "issue"]
                .iter()
                .map(|v| (*v).to_string())
                .collect(),
            min_conversation_len: 10,
        }
    }
}

/// Every detector threshold from the analysis battery. Exposed as plain
/// config fields so operators can tune them and tests can pin them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatThresholds {
    /// Weighted phishing keyword score at or above this is at least HIGH.
    pub phishing_score_min: u32,
    /// Social-engineering keyword score strictly above this is at least MEDIUM.
    pub social_score_over: u32,
    pub spam_frequency_window_secs: i64,
    /// Messages per frequency window strictly above this add to the spam score.
    pub spam_frequency_over: u32,
    /// Jaccard word-set similarity strictly above this counts as a repeat.
    pub spam_similarity_min: f64,
    /// Identical (actor, length, prefix) fingerprints strictly above this
    /// add to the spam score.
    pub spam_fingerprint_over: u32,
    /// Combined spam score strictly above this is at least MEDIUM.
    pub spam_score_over: u32,
    /// Mention count at or above this is HIGH.
    pub mass_mention_min: u32,
    pub raid_window_secs: i64,
    /// Accounts younger than this many seconds count toward the raid burst.
    pub raid_young_account_secs: i64,
    /// Young-account messages within the raid window at or above this is CRITICAL.
    pub raid_young_message_min: u32,
    pub raid_prefix_len: usize,
    /// Identical guild-wide message prefixes strictly above this is CRITICAL.
    pub raid_prefix_over: u32,
    /// Behavioral anomaly score strictly above this is at least MEDIUM.
    pub anomaly_score_over: f64,
    /// Minimum observed messages before anomaly scoring applies to an actor.
    pub anomaly_min_history: u64,
    /// Relative deviation from the actor's running average message length
    /// that counts as anomalous (2.0 == 200%).
    pub anomaly_length_deviation: f64,
    /// Overlap with the actor's common vocabulary strictly below this counts
    /// as anomalous.
    pub anomaly_vocab_overlap_min: f64,
    /// Credential keyword hits at or above this (plus a request phrase) is CRITICAL.
    pub credential_keyword_min: u32,
    /// Distinct matched signal categories at or above this bump the level once.
    pub escalation_signal_min: usize,
    /// Temporal-risk + context-risk strictly above this bump the level once.
    pub combined_risk_over: f64,
    pub channel_history_len: usize,
}

impl Default for ThreatThresholds {
    fn default() -> Self {
        Self {
            phishing_score_min: 3,
            social_score_over: 2,
            spam_frequency_window_secs: 60,
            spam_frequency_over: 8,
            spam_similarity_min: 0.85,
            spam_fingerprint_over: 3,
            spam_score_over: 5,
            mass_mention_min: 6,
            raid_window_secs: 300,
            raid_young_account_secs: 300,
            raid_young_message_min: 5,
            raid_prefix_len: 50,
            raid_prefix_over: 3,
            anomaly_score_over: 0.7,
            anomaly_min_history: 10,
            anomaly_length_deviation: 2.0,
            anomaly_vocab_overlap_min: 0.3,
            credential_keyword_min: 2,
            escalation_signal_min: 2,
            combined_risk_over: 0.5,
            channel_history_len: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePolicy {
    pub timeout_medium_hours: i64,
    pub timeout_high_hours: i64,
    pub ban_fallback_timeout_hours: i64,
    /// CRITICAL-or-higher events per guild within the emergency window that
    /// trigger lockdown.
    pub emergency_event_min: usize,
    pub emergency_window_secs: i64,
    pub event_retention_hours: i64,
    pub quarantine_release_hours: i64,
    pub profile_retention_days: i64,
    /// Quiet period after which lockdown recovery is *detected* (never
    /// auto-applied; lifting stays a manual operator action).
    pub recovery_quiet_secs: i64,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            timeout_medium_hours: 1,
            timeout_high_hours: 12,
            ban_fallback_timeout_hours: 24,
            emergency_event_min: 10,
            emergency_window_secs: 300,
            event_retention_hours: 24,
            quarantine_release_hours: 24,
            profile_retention_days: 7,
            recovery_quiet_secs: 600,
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            discord: DiscordConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scheduler: SchedulerSettings::default(),
            classifier: ClassifierConfig::default(),
            threat: ThreatThresholds::default(),
            response: ResponsePolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl WardenConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("WARDEN_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        if path.exists() {
            let cfg = Self::load(&path)?;
            return Ok((cfg, path, false));
        }

        let cfg = Self::default();
        cfg.save(&path)?;
        Ok((cfg, path, true))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_admissions == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit window and size must be positive".to_string(),
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.queue_capacity must be positive".to_string(),
            ));
        }
        if self.scheduler.worker_ceiling == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.worker_ceiling must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.threat.spam_similarity_min) {
            return Err(ConfigError::ValidationFailed(
                "threat.spam_similarity_min must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.threat.anomaly_score_over) {
            return Err(ConfigError::ValidationFailed(
                "threat.anomaly_score_over must be within [0, 1]".to_string(),
            ));
        }
        if self.response.emergency_event_min == 0 {
            return Err(ConfigError::ValidationFailed(
                "response.emergency_event_min must be positive".to_string(),
            ));
        }
        if self.discord.token_env.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "discord.token_env cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_round_trips_through_toml() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let cfg = WardenConfig::default();
        cfg.save(&path).expect("save");
        let loaded = WardenConfig::load(&path).expect("load");
        assert_eq!(loaded.rate_limit.max_admissions, 5);
        assert_eq!(loaded.scheduler.queue_capacity, 1_000);
        assert_eq!(loaded.threat.phishing_score_min, 3);
        assert_eq!(loaded.response.emergency_event_min, 10);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: WardenConfig = toml::from_str(
            r#"
            log_level = "debug"

            [rate_limit]
            max_admissions = 3
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.rate_limit.max_admissions, 3);
        assert_eq!(cfg.rate_limit.window_secs, 10);
        assert_eq!(cfg.scheduler.worker_ceiling, 50);
    }

    #[test]
    fn validate_rejects_zero_worker_ceiling() {
        let mut cfg = WardenConfig::default();
        cfg.scheduler.worker_ceiling = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_similarity() {
        let mut cfg = WardenConfig::default();
        cfg.threat.spam_similarity_min = 1.5;
        assert!(cfg.validate().is_err());
    }
}
