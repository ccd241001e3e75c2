//! Drop campaign sync.
//!
//! Periodically claims finished drops and marks which streamers are running
//! a campaign with unclaimed progress, which feeds the `DROPS` heartbeat tier.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::TwitchApi;
use crate::error::Result;
use crate::store::EntityStore;
use crate::streamer::Streamer;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// A drop campaign in progress with at least one unclaimed reward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropCampaign {
    pub name: String,
    pub game: String,
    /// Logins that can progress the campaign. Empty means any channel playing `game`.
    pub channels: Vec<String>,
}

impl DropCampaign {
    pub fn applies_to(&self, streamer: &Streamer) -> bool {
        let plays_game = streamer
            .stream
            .game
            .as_deref()
            .is_some_and(|game| game.eq_ignore_ascii_case(&self.game));
        plays_game
            && (self.channels.is_empty() || self.channels.iter().any(|c| *c == streamer.username))
    }
}

pub struct DropsSync {
    store: Arc<EntityStore>,
    api: Arc<dyn TwitchApi>,
    interval: Duration,
    guard_wait: Duration,
}

impl DropsSync {
    pub fn new(store: Arc<EntityStore>, api: Arc<dyn TwitchApi>) -> Self {
        Self {
            store,
            api,
            interval: SYNC_INTERVAL,
            guard_wait: Duration::from_secs(5),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One round: claim what is finished, then flag streamers offering drops.
    ///
    /// Returns the channel ids now offering drops, in declaration order.
    pub async fn sync(&self) -> Result<Vec<String>> {
        match self.api.claim_available_rewards().await {
            Ok(0) => {}
            Ok(claimed) => tracing::info!(claimed, "Claimed drops"),
            Err(e) => tracing::warn!(cause = e.cause(), error = %e, "Claiming drops failed"),
        }
        let campaigns = self.api.drop_campaigns().await?;

        let mut offering = Vec::new();
        for handle in self.store.streamers() {
            let Ok(mut streamer) = tokio::time::timeout(self.guard_wait, handle.lock()).await else {
                tracing::warn!("Streamer guard busy, skipping drops update");
                continue;
            };
            let available = streamer.is_online
                && streamer.settings.claim_drops
                && campaigns.iter().any(|c| c.applies_to(&streamer));
            if available != streamer.stream.drops_available {
                tracing::info!(channel = %streamer.username, available, "Drops availability changed");
            }
            streamer.stream.drops_available = available;
            if available {
                offering.push(streamer.channel_id.clone());
            }
        }
        Ok(offering)
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Drops sync started");
        loop {
            if let Err(e) = self.sync().await {
                tracing::warn!(cause = e.cause(), error = %e, "Drops sync failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("Drops sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(username: &str, game: &str) -> Streamer {
        let mut streamer = Streamer::new(username);
        streamer.stream.game = Some(game.to_string());
        streamer
    }

    #[test]
    fn test_campaign_matches_game_and_channel() {
        let open = DropCampaign {
            name: "Spring".into(),
            game: "Rust".into(),
            channels: Vec::new(),
        };
        assert!(open.applies_to(&playing("a", "rust")));
        assert!(!open.applies_to(&playing("a", "Minecraft")));
        assert!(!open.applies_to(&Streamer::new("a")));

        let restricted = DropCampaign {
            channels: vec!["b".into()],
            ..open
        };
        assert!(!restricted.applies_to(&playing("a", "Rust")));
        assert!(restricted.applies_to(&playing("b", "Rust")));
    }
}
