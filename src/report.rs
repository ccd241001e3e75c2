//! End-of-session summary.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::prediction::PredictionEvent;
use crate::streamer::Streamer;

/// Identity and start time of one mining session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn start() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        Self {
            id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamerSummary {
    pub username: String,
    pub channel_id: String,
    pub channel_points: u64,
    pub gained: i64,
    pub history: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionSummary {
    pub settings: String,
    pub filter: Option<String>,
    pub recap: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: Session,
    pub ended_at: DateTime<Utc>,
    pub predictions: Vec<PredictionSummary>,
    pub streamers: Vec<StreamerSummary>,
    /// Streamers whose state could not be read at shutdown.
    pub unavailable: Vec<String>,
}

impl SessionReport {
    /// `base_points` holds each streamer's balance when it was first loaded.
    pub fn build(
        session: &Session,
        streamers: &[Streamer],
        events: &[PredictionEvent],
        base_points: &HashMap<String, u64>,
        unavailable: Vec<String>,
    ) -> Self {
        let predictions = events
            .iter()
            .filter(|e| e.bet_confirmed)
            .filter_map(|e| {
                let streamer = streamers.iter().find(|s| s.channel_id == e.channel_id)?;
                if !streamer.settings.make_predictions {
                    return None;
                }
                let bet = &streamer.settings.bet;
                Some(PredictionSummary {
                    settings: bet.to_string(),
                    filter: bet.filter_condition.map(|f| f.to_string()),
                    recap: e.recap(),
                })
            })
            .collect();

        let streamers = streamers
            .iter()
            .filter(|s| !s.history.is_empty())
            .map(|s| {
                let base = base_points.get(&s.username).copied().unwrap_or(s.channel_points);
                StreamerSummary {
                    username: s.username.clone(),
                    channel_id: s.channel_id.clone(),
                    channel_points: s.channel_points,
                    gained: s.channel_points as i64 - base as i64,
                    history: s.history.to_string(),
                }
            })
            .collect();

        Self {
            session: session.clone(),
            ended_at: Utc::now(),
            predictions,
            streamers,
            unavailable,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.session.started_at
    }

    pub fn gained(&self, username: &str) -> Option<i64> {
        self.streamers
            .iter()
            .find(|s| s.username == username)
            .map(|s| s.gained)
    }

    pub fn log(&self) {
        tracing::info!(session = %self.session.id, "Ending session");
        tracing::info!(duration = %format_duration(self.duration()), "Session duration");
        for p in &self.predictions {
            tracing::info!("{}", p.settings);
            if let Some(filter) = &p.filter {
                tracing::info!("{}", filter);
            }
            tracing::info!("{}", p.recap);
        }
        for s in &self.streamers {
            tracing::info!(
                channel = %s.username,
                points = s.channel_points,
                gained = s.gained,
                "Total points gained"
            );
            tracing::info!(channel = %s.username, "{}", s.history);
        }
        if !self.unavailable.is_empty() {
            tracing::warn!(streamers = ?self.unavailable, "State unavailable at shutdown");
        }
    }
}

fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {} ({})", self.session.id, format_duration(self.duration()))?;
        for p in &self.predictions {
            writeln!(f, "  {}", p.recap)?;
        }
        for s in &self.streamers {
            writeln!(
                f,
                "  {}: {} points, gained {:+} [{}]",
                s.username, s.channel_points, s.gained, s.history
            )?;
        }
        for name in &self.unavailable {
            writeln!(f, "  {}: unavailable", name)?;
        }
        Ok(())
    }
}
