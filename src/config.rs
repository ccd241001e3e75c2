//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use crate::settings::{
    is_valid_delay, BetSettings, DelayMode, Priority, Stake, StreamerSettings, Strategy,
};
use crate::transport::PUBSUB_URL;

/// Miner configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Twitch login of the viewer account
    pub username: String,
    /// OAuth token of the viewer account
    pub auth_token: String,
    /// Streamers listed directly, in priority order
    pub streamers: Vec<String>,
    /// JSON file with streamers and their setting overrides
    pub tracking_file: Option<PathBuf>,
    /// Never mine these, whatever the source
    pub blacklist: Vec<String>,
    /// Also mine every followed channel
    pub followers: bool,
    /// Heartbeat ranking
    pub priority: Vec<Priority>,
    /// Reload the streamer sources every N minutes
    pub refresh_minutes: Option<u64>,
    /// Claim finished drops once at startup
    pub claim_drops_startup: bool,
    pub pubsub_url: String,
    pub log_level: String,
    pub status_port: Option<u16>,
    /// Settings for streamers that do not override them
    pub defaults: StreamerSettings,
}

fn list(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn flag(raw: Option<String>, default: bool, var: &'static str) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(var)),
        },
    }
}

fn parsed<T: std::str::FromStr>(raw: Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    raw.map(|v| v.trim().parse().map_err(|_| ConfigError::InvalidValue(var)))
        .transpose()
}

fn strategy(raw: &str) -> Option<Strategy> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_uppercase())).ok()
}

fn delay_mode(raw: &str) -> Option<DelayMode> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_uppercase())).ok()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `get`, which maps a variable name to its value.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let username = get("MINER_USERNAME")
            .map(|u| u.trim().to_lowercase())
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingVar("MINER_USERNAME"))?;

        let auth_token = get("MINER_AUTH_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingVar("MINER_AUTH_TOKEN"))?;

        let priority = match get("MINER_PRIORITY") {
            None => Priority::default_list(),
            Some(raw) => raw
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| Priority::parse(p).ok_or(ConfigError::InvalidValue("MINER_PRIORITY")))
                .collect::<Result<Vec<_>, _>>()?,
        };

        let base = BetSettings::default();
        let stake = match (
            parsed::<u64>(get("MINER_BET_FIXED"), "MINER_BET_FIXED")?,
            parsed::<u8>(get("MINER_BET_PERCENTAGE"), "MINER_BET_PERCENTAGE")?,
        ) {
            (Some(points), _) => Stake::Fixed(points),
            (None, Some(p)) if p <= 100 => Stake::Percentage(p),
            (None, Some(_)) => return Err(ConfigError::InvalidValue("MINER_BET_PERCENTAGE")),
            (None, None) => base.stake,
        };
        let bet = BetSettings {
            strategy: match get("MINER_BET_STRATEGY") {
                Some(raw) => strategy(&raw).ok_or(ConfigError::InvalidValue("MINER_BET_STRATEGY"))?,
                None => base.strategy,
            },
            stake,
            max_points: parsed(get("MINER_BET_MAX_POINTS"), "MINER_BET_MAX_POINTS")?
                .unwrap_or(base.max_points),
            minimum_points: parsed(get("MINER_BET_MINIMUM_POINTS"), "MINER_BET_MINIMUM_POINTS")?
                .unwrap_or(base.minimum_points),
            percentage_gap: parsed(get("MINER_BET_PERCENTAGE_GAP"), "MINER_BET_PERCENTAGE_GAP")?
                .unwrap_or(base.percentage_gap),
            stealth_mode: flag(get("MINER_BET_STEALTH"), base.stealth_mode, "MINER_BET_STEALTH")?,
            delay_mode: match get("MINER_BET_DELAY_MODE") {
                Some(raw) => delay_mode(&raw).ok_or(ConfigError::InvalidValue("MINER_BET_DELAY_MODE"))?,
                None => base.delay_mode,
            },
            delay: match parsed::<f64>(get("MINER_BET_DELAY"), "MINER_BET_DELAY")? {
                Some(delay) if is_valid_delay(delay) => delay,
                Some(_) => return Err(ConfigError::InvalidValue("MINER_BET_DELAY")),
                None => base.delay,
            },
            filter_condition: None,
        };

        let base = StreamerSettings::default();
        let defaults = StreamerSettings {
            make_predictions: flag(get("MINER_MAKE_PREDICTIONS"), base.make_predictions, "MINER_MAKE_PREDICTIONS")?,
            follow_raid: flag(get("MINER_FOLLOW_RAID"), base.follow_raid, "MINER_FOLLOW_RAID")?,
            claim_drops: flag(get("MINER_CLAIM_DROPS"), base.claim_drops, "MINER_CLAIM_DROPS")?,
            watch_streak: flag(get("MINER_WATCH_STREAK"), base.watch_streak, "MINER_WATCH_STREAK")?,
            join_chat: flag(get("MINER_JOIN_CHAT"), base.join_chat, "MINER_JOIN_CHAT")?,
            bet,
        };

        let log_level = get("MINER_LOG_LEVEL")
            .or_else(|| get("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            username,
            auth_token,
            streamers: list(get("MINER_STREAMERS")),
            tracking_file: get("MINER_TRACKING_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            blacklist: list(get("MINER_BLACKLIST")),
            followers: flag(get("MINER_FOLLOWERS"), false, "MINER_FOLLOWERS")?,
            priority,
            refresh_minutes: parsed(get("MINER_REFRESH_MINUTES"), "MINER_REFRESH_MINUTES")?,
            claim_drops_startup: flag(get("MINER_CLAIM_DROPS_STARTUP"), false, "MINER_CLAIM_DROPS_STARTUP")?,
            pubsub_url: get("MINER_PUBSUB_URL").unwrap_or_else(|| PUBSUB_URL.to_string()),
            log_level,
            status_port: parsed(get("MINER_STATUS_PORT"), "MINER_STATUS_PORT")?,
            defaults,
        })
    }

    /// At least one source of streamers is configured.
    pub fn has_sources(&self) -> bool {
        !self.streamers.is_empty() || self.tracking_file.is_some() || self.followers
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVar(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(var) => write!(f, "Invalid value for: {}", var),
        }
    }
}

impl std::error::Error for ConfigError {}
