//! Minute-watched scheduler.
//!
//! Once a minute, pick at most two online streamers by the configured
//! priority list and send a watch heartbeat for each.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::TwitchApi;
use crate::settings::Priority;
use crate::store::EntityStore;
use crate::streamer::Streamer;

/// Upstream only credits this many channels at once.
pub const MAX_CONCURRENT_HEARTBEATS: usize = 2;
pub const TICK: Duration = Duration::from_secs(60);

fn eligible(streamer: &Streamer, own_login: &str) -> bool {
    streamer.is_online && streamer.username != own_login
}

/// Pick the streamers to watch this tick. Pure and deterministic.
///
/// `snapshot` must be in declaration order; ties inside a tier keep it.
pub fn select(
    snapshot: &[Streamer],
    priorities: &[Priority],
    own_login: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<String> {
    let candidates: Vec<&Streamer> = snapshot
        .iter()
        .filter(|s| eligible(s, own_login))
        .collect();
    let mut picked: Vec<String> = Vec::new();

    for priority in priorities {
        if picked.len() >= limit {
            break;
        }
        let mut tier: Vec<&Streamer> = match priority {
            Priority::Streak => candidates
                .iter()
                .copied()
                .filter(|s| s.is_streak_candidate(now))
                .collect(),
            Priority::Drops => candidates
                .iter()
                .copied()
                .filter(|s| s.has_claimable_drops())
                .collect(),
            Priority::Subscribed | Priority::Order => candidates.clone(),
            Priority::PointsAscending | Priority::PointsDescending => candidates.clone(),
        };
        match priority {
            Priority::PointsAscending => tier.sort_by_key(|s| s.channel_points),
            Priority::PointsDescending => tier.sort_by_key(|s| std::cmp::Reverse(s.channel_points)),
            _ => {}
        }
        for streamer in tier {
            if picked.len() >= limit {
                break;
            }
            if !picked.contains(&streamer.channel_id) {
                picked.push(streamer.channel_id.clone());
            }
        }
    }
    picked
}

pub struct MinuteWatcher {
    store: Arc<EntityStore>,
    api: Arc<dyn TwitchApi>,
    priorities: Vec<Priority>,
    own_login: String,
    interval: Duration,
    limit: usize,
    /// Longest wait for one streamer guard while taking the snapshot.
    guard_wait: Duration,
}

impl MinuteWatcher {
    pub fn new(store: Arc<EntityStore>, api: Arc<dyn TwitchApi>, priorities: Vec<Priority>) -> Self {
        let own_login = api.login().to_string();
        Self {
            store,
            api,
            priorities,
            own_login,
            interval: TICK,
            limit: MAX_CONCURRENT_HEARTBEATS,
            guard_wait: Duration::from_secs(5),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_guard_wait(mut self, wait: Duration) -> Self {
        self.guard_wait = wait;
        self
    }

    /// Send one round of heartbeats. Returns `(channel_id, sent)` per selected streamer.
    ///
    /// Heartbeats are spaced evenly across the tick.
    pub async fn tick(&self, cancel: &CancellationToken) -> Vec<(String, bool)> {
        let (snapshot, busy) = self.store.snapshot_within(self.guard_wait).await;
        if !busy.is_empty() {
            tracing::warn!(channels = ?busy, "Skipping busy streamers this tick");
        }
        let selected = select(&snapshot, &self.priorities, &self.own_login, self.limit, Utc::now());
        if selected.is_empty() {
            return Vec::new();
        }
        let spacing = self.interval / selected.len() as u32;
        let mut results = Vec::with_capacity(selected.len());

        for channel_id in selected {
            let Some(streamer) = snapshot.iter().find(|s| s.channel_id == channel_id) else {
                continue;
            };
            let sent = match self.api.send_minute_watched(streamer).await {
                Ok(()) => {
                    let watched = self
                        .store
                        .with_streamer(&channel_id, |s| {
                            s.stream.minute_watched += 1;
                            s.stream.minute_watched
                        })
                        .await;
                    tracing::debug!(channel = %streamer.username, minutes = ?watched, "Minute watched");
                    true
                }
                Err(e) => {
                    tracing::warn!(channel = %streamer.username, error = %e, "Heartbeat failed");
                    false
                }
            };
            results.push((channel_id, sent));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(spacing) => {}
            }
        }
        results
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(priorities = ?self.priorities, "Minute watcher started");
        while !cancel.is_cancelled() {
            let results = self.tick(&cancel).await;
            if results.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        tracing::info!("Minute watcher stopped");
    }
}
