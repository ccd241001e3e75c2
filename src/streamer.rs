//! Tracked streamer state and point history.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::settings::{SettingsOverrides, StreamerSettings};

/// Minutes of watching after which the watch streak is assumed claimed.
pub const STREAK_MINUTES: u32 = 7;
/// A stream that went down less than this long ago does not restart a streak.
pub const STREAK_OFFLINE_GRACE_MINUTES: i64 = 30;

/// Aggregated deltas for one cause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub counter: u32,
    pub amount: i64,
}

/// A single recorded point change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointRecord {
    pub at: DateTime<Utc>,
    pub cause: String,
    pub delta: i64,
}

/// Point deltas by cause, plus the ordered log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    by_cause: BTreeMap<String, HistoryEntry>,
    records: Vec<PointRecord>,
}

impl History {
    pub fn record(&mut self, cause: &str, delta: i64) {
        let entry = self.by_cause.entry(cause.to_string()).or_default();
        entry.counter += 1;
        entry.amount += delta;
        self.records.push(PointRecord {
            at: Utc::now(),
            cause: cause.to_string(),
            delta,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, cause: &str) -> Option<&HistoryEntry> {
        self.by_cause.get(cause)
    }

    pub fn records(&self) -> &[PointRecord] {
        &self.records
    }

    pub fn total(&self) -> i64 {
        self.by_cause.values().map(|e| e.amount).sum()
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .by_cause
            .iter()
            .map(|(cause, e)| format!("{}({} times, {:+} points)", cause, e.counter, e.amount))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Live stream metadata and watch bookkeeping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamInfo {
    pub broadcast_id: Option<String>,
    pub title: Option<String>,
    pub game: Option<String>,
    pub viewers: u64,
    pub watch_streak_missing: bool,
    pub minute_watched: u32,
    /// A drop campaign with claimable progress is running on this channel.
    pub drops_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Raid {
    pub raid_id: String,
    pub target_login: String,
}

/// One tracked channel.
#[derive(Debug, Clone, Serialize)]
pub struct Streamer {
    pub username: String,
    pub channel_id: String,
    pub display_name: String,
    pub channel_points: u64,
    pub is_online: bool,
    pub online_at: Option<DateTime<Utc>>,
    pub offline_at: Option<DateTime<Utc>>,
    pub viewer_is_mod: bool,
    pub settings: StreamerSettings,
    /// Settings exactly as written in the tracking file.
    #[serde(skip)]
    pub overrides: SettingsOverrides,
    pub stream: StreamInfo,
    pub history: History,
    pub raid: Option<Raid>,
    pub init_processed: bool,
    /// Confirmed bets whose settlement has not reached the balance here yet.
    #[serde(skip)]
    open_bets: u32,
    /// Payout or refund balance frames that arrived before their event settled.
    #[serde(skip)]
    early_settlements: u32,
}

impl Streamer {
    pub fn new(username: &str) -> Self {
        let username = username.trim().to_lowercase();
        Self {
            display_name: username.clone(),
            username,
            channel_id: String::new(),
            channel_points: 0,
            is_online: false,
            online_at: None,
            offline_at: None,
            viewer_is_mod: false,
            settings: StreamerSettings::default(),
            overrides: SettingsOverrides::default(),
            stream: StreamInfo::default(),
            history: History::default(),
            raid: None,
            init_processed: false,
            open_bets: 0,
            early_settlements: 0,
        }
    }

    pub fn with_overrides(username: &str, overrides: SettingsOverrides) -> Self {
        let mut streamer = Self::new(username);
        streamer.overrides = overrides;
        streamer
    }

    /// Re-apply tracking-file overrides on top of the global defaults.
    pub fn apply_defaults(&mut self, defaults: &StreamerSettings) {
        self.settings = self.overrides.resolve(defaults);
        if self.viewer_is_mod {
            self.settings.make_predictions = false;
        }
    }

    pub fn set_online(&mut self) {
        if self.is_online {
            return;
        }
        self.is_online = true;
        self.online_at = Some(Utc::now());
        self.stream.minute_watched = 0;
        self.stream.watch_streak_missing = true;
        tracing::info!(channel = %self.username, "Streamer is online");
    }

    pub fn set_offline(&mut self) {
        if !self.is_online {
            return;
        }
        self.is_online = false;
        self.offline_at = Some(Utc::now());
        tracing::info!(channel = %self.username, "Streamer is offline");
    }

    /// Set the balance and record a history entry when the change has a cause.
    pub fn apply_balance(&mut self, balance: u64, cause: Option<(&str, i64)>) {
        self.channel_points = balance;
        if let Some((cause, delta)) = cause {
            self.history.record(cause, delta);
            if cause == "WATCH_STREAK" {
                self.stream.watch_streak_missing = false;
            }
        }
    }

    pub fn bet_placed(&mut self) {
        self.open_bets += 1;
    }

    pub fn open_bets(&self) -> u32 {
        self.open_bets
    }

    /// Apply an upstream balance that already includes a payout or refund.
    ///
    /// While a bet is open the frame is remembered, so the matching
    /// [`settle_bet`](Self::settle_bet) does not add the same points again.
    pub fn apply_settlement_balance(&mut self, balance: u64, gained: i64) {
        self.channel_points = balance;
        if gained > 0 && self.open_bets > self.early_settlements {
            self.early_settlements += 1;
        }
    }

    /// Credit a payout or refund for a settled bet. Returns false when an
    /// earlier balance frame already carried it.
    pub fn settle_bet(&mut self, cause: &str, amount: u64) -> bool {
        self.open_bets = self.open_bets.saturating_sub(1);
        if amount == 0 {
            return false;
        }
        self.history.record(cause, amount as i64);
        if self.early_settlements > 0 {
            self.early_settlements -= 1;
            return false;
        }
        self.channel_points = self.channel_points.saturating_add(amount);
        true
    }

    /// Whether watching now would likely earn the watch streak bonus.
    pub fn is_streak_candidate(&self, now: DateTime<Utc>) -> bool {
        let long_offline = match self.offline_at {
            None => true,
            Some(at) => now - at > Duration::minutes(STREAK_OFFLINE_GRACE_MINUTES),
        };
        self.settings.watch_streak
            && self.stream.watch_streak_missing
            && long_offline
            && self.stream.minute_watched < STREAK_MINUTES
    }

    pub fn has_claimable_drops(&self) -> bool {
        self.settings.claim_drops && self.stream.drops_available
    }
}

impl fmt::Display for Streamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Streamer(username={}, channel_id={}, channel_points={})",
            self.username, self.channel_id, self.channel_points
        )
    }
}
