//! Per-streamer feature settings and bet settings.
//!
//! The tracking file stores overrides only; anything left out falls back to
//! the global defaults when the streamer is loaded.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the outcome to bet on is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Outcome with the most users.
    MostVoted,
    /// Outcome paying the most per point (fewest points on it).
    HighOdds,
    /// Outcome paying the least per point (most points on it).
    LowOdds,
    /// Outcome holding the largest share of points.
    Percentage,
    /// Outcome whose top predictor staked the most.
    SmartMoney,
    /// Most voted, unless users are split within `percentage_gap`, then high odds.
    Smart,
}

/// How much to stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "mode", content = "value")]
pub enum Stake {
    Fixed(u64),
    /// Percentage of the current balance (0-100).
    Percentage(u8),
}

/// When to place the bet inside the prediction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayMode {
    /// `delay` seconds after the event opened.
    FromStart,
    /// `delay` seconds before the window closes.
    FromEnd,
    /// At `delay` (0.0-1.0) of the window.
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKey {
    PercentageUsers,
    OddsPercentage,
    Odds,
    TopPoints,
    TotalUsers,
    TotalPoints,
    DecisionUsers,
    DecisionPoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Condition {
    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            Condition::Gt => left > right,
            Condition::Lt => left < right,
            Condition::Gte => left >= right,
            Condition::Lte => left <= right,
        }
    }
}

/// Skip the bet unless `by <where> value` holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub by: OutcomeKey,
    #[serde(rename = "where")]
    pub condition: Condition,
    pub value: f64,
}

impl fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FilterCondition(by={:?}, where={:?}, value={})",
            self.by, self.condition, self.value
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetSettings {
    pub strategy: Strategy,
    pub stake: Stake,
    /// Upper bound on a single stake.
    pub max_points: u64,
    /// Skip betting when the balance is below this.
    pub minimum_points: u64,
    /// Used by `Strategy::Smart`.
    pub percentage_gap: u8,
    /// Bet a little less than the top predictor on the chosen outcome.
    pub stealth_mode: bool,
    pub delay_mode: DelayMode,
    pub delay: f64,
    pub filter_condition: Option<FilterCondition>,
}

impl Default for BetSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::Smart,
            stake: Stake::Percentage(5),
            max_points: 50_000,
            minimum_points: 0,
            percentage_gap: 20,
            stealth_mode: false,
            delay_mode: DelayMode::FromEnd,
            delay: 6.0,
            filter_condition: None,
        }
    }
}

/// Delays must be finite and non-negative.
pub fn is_valid_delay(delay: f64) -> bool {
    delay.is_finite() && delay >= 0.0
}

impl fmt::Display for BetSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BetSettings(strategy={:?}, stake={:?}, max_points={}, minimum_points={}, stealth_mode={}, delay_mode={:?}, delay={})",
            self.strategy,
            self.stake,
            self.max_points,
            self.minimum_points,
            self.stealth_mode,
            self.delay_mode,
            self.delay
        )
    }
}

/// Resolved settings for one streamer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamerSettings {
    pub make_predictions: bool,
    pub follow_raid: bool,
    pub claim_drops: bool,
    pub watch_streak: bool,
    pub join_chat: bool,
    pub bet: BetSettings,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            make_predictions: true,
            follow_raid: true,
            claim_drops: true,
            watch_streak: true,
            join_chat: false,
            bet: BetSettings::default(),
        }
    }
}

/// Bet overrides as written in the tracking file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stake: Option<Stake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_points: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_points: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage_gap: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stealth_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_mode: Option<DelayMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<FilterCondition>,
}

/// Streamer overrides as written in the tracking file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_predictions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_raid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_drops: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_streak: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_chat: Option<bool>,
    pub bet: BetOverrides,
}

impl SettingsOverrides {
    /// Fill every missing field from `defaults`.
    pub fn resolve(&self, defaults: &StreamerSettings) -> StreamerSettings {
        let bet = &self.bet;
        let base = &defaults.bet;
        StreamerSettings {
            make_predictions: self.make_predictions.unwrap_or(defaults.make_predictions),
            follow_raid: self.follow_raid.unwrap_or(defaults.follow_raid),
            claim_drops: self.claim_drops.unwrap_or(defaults.claim_drops),
            watch_streak: self.watch_streak.unwrap_or(defaults.watch_streak),
            join_chat: self.join_chat.unwrap_or(defaults.join_chat),
            bet: BetSettings {
                strategy: bet.strategy.unwrap_or(base.strategy),
                stake: bet.stake.unwrap_or(base.stake),
                max_points: bet.max_points.unwrap_or(base.max_points),
                minimum_points: bet.minimum_points.unwrap_or(base.minimum_points),
                percentage_gap: bet.percentage_gap.unwrap_or(base.percentage_gap),
                stealth_mode: bet.stealth_mode.unwrap_or(base.stealth_mode),
                delay_mode: bet.delay_mode.unwrap_or(base.delay_mode),
                delay: match bet.delay {
                    Some(delay) if is_valid_delay(delay) => delay,
                    Some(delay) => {
                        tracing::warn!(delay, default = base.delay, "Ignoring invalid bet delay override");
                        base.delay
                    }
                    None => base.delay,
                },
                filter_condition: bet.filter_condition.or(base.filter_condition),
            },
        }
    }
}

/// Heartbeat ranking tiers, in the order they are listed in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Streak,
    Drops,
    Subscribed,
    Order,
    PointsAscending,
    PointsDescending,
}

impl Priority {
    /// Parse from config text (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "STREAK" => Some(Priority::Streak),
            "DROPS" => Some(Priority::Drops),
            "SUBSCRIBED" => Some(Priority::Subscribed),
            "ORDER" => Some(Priority::Order),
            "POINTS_ASCENDING" => Some(Priority::PointsAscending),
            "POINTS_DESCENDING" => Some(Priority::PointsDescending),
            _ => None,
        }
    }

    pub fn default_list() -> Vec<Priority> {
        vec![Priority::Streak, Priority::Drops, Priority::Order]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_fill_from_defaults() {
        let overrides: SettingsOverrides = serde_json::from_str(
            r#"{"make_predictions": false, "bet": {"strategy": "HIGH_ODDS", "max_points": 100}}"#,
        )
        .unwrap();
        let resolved = overrides.resolve(&StreamerSettings::default());
        assert!(!resolved.make_predictions);
        assert!(resolved.follow_raid);
        assert_eq!(resolved.bet.strategy, Strategy::HighOdds);
        assert_eq!(resolved.bet.max_points, 100);
        assert_eq!(resolved.bet.stake, Stake::Percentage(5));
    }

    #[test]
    fn test_negative_delay_override_falls_back() {
        let overrides: SettingsOverrides =
            serde_json::from_str(r#"{"bet": {"delay_mode": "FROM_START", "delay": -5.0}}"#).unwrap();
        let resolved = overrides.resolve(&StreamerSettings::default());
        assert_eq!(resolved.bet.delay_mode, DelayMode::FromStart);
        assert_eq!(resolved.bet.delay, 6.0);

        let mut overrides = SettingsOverrides::default();
        overrides.bet.delay = Some(f64::NAN);
        assert_eq!(overrides.resolve(&StreamerSettings::default()).bet.delay, 6.0);
        overrides.bet.delay = Some(2.5);
        assert_eq!(overrides.resolve(&StreamerSettings::default()).bet.delay, 2.5);
    }

    #[test]
    fn test_empty_overrides_serialize_compactly() {
        let json = serde_json::to_string(&SettingsOverrides::default()).unwrap();
        assert_eq!(json, r#"{"bet":{}}"#);
    }

    #[test]
    fn test_stake_wire_format() {
        let stake: Stake = serde_json::from_str(r#"{"mode":"FIXED","value":10}"#).unwrap();
        assert_eq!(stake, Stake::Fixed(10));
    }

    #[test]
    fn test_filter_condition_wire_format() {
        let filter: FilterCondition =
            serde_json::from_str(r#"{"by":"total_users","where":"GTE","value":200}"#).unwrap();
        assert_eq!(filter.by, OutcomeKey::TotalUsers);
        assert!(filter.condition.holds(200.0, filter.value));
        assert!(!filter.condition.holds(199.0, filter.value));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("streak"), Some(Priority::Streak));
        assert_eq!(Priority::parse(" POINTS_ASCENDING "), Some(Priority::PointsAscending));
        assert_eq!(Priority::parse("nope"), None);
    }
}
