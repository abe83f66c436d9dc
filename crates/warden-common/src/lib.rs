pub mod config;
pub mod logging;

pub const APP_NAME: &str = "WARDEN";

pub use config::{
    ClassifierConfig, ConfigError, DiscordConfig, RateLimitConfig, ResponsePolicy,
    SchedulerSettings, ThreatThresholds, WardenConfig,
};
