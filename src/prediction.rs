//! Prediction events and their lifecycle.
//!
//! `ACTIVE -> LOCKED -> RESOLVED | CANCELED`, with `ACTIVE -> CANCELED` and
//! `ACTIVE -> RESOLVED` (missed lock frame) also allowed. Terminal states
//! never go back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::settings::{BetSettings, DelayMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventStatus {
    Active,
    Locked,
    Resolved,
    Canceled,
}

impl EventStatus {
    /// Upstream status names. Pending states behave like a lock.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(EventStatus::Active),
            "LOCKED" | "RESOLVE_PENDING" | "CANCEL_PENDING" => Some(EventStatus::Locked),
            "RESOLVED" => Some(EventStatus::Resolved),
            "CANCELED" | "CANCELLED" => Some(EventStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Resolved | EventStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        match (*self, next) {
            (a, b) if a == b => true,
            (Active, Locked | Resolved | Canceled) => true,
            (Locked, Resolved | Canceled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BetResult {
    Unknown,
    Win,
    Lose,
    Refund,
}

impl BetResult {
    pub fn parse(s: &str) -> Self {
        match s {
            "WIN" => BetResult::Win,
            "LOSE" => BetResult::Lose,
            "REFUND" => BetResult::Refund,
            _ => BetResult::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub id: String,
    pub title: String,
    pub total_points: u64,
    pub total_users: u64,
    /// Largest single stake on this outcome.
    pub top_points: u64,
}

/// What a status change did, for the caller to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Locked,
    /// Resolved; carries the payout to credit (0 without a confirmed bet or on a loss).
    Resolved { payout: u64 },
    /// Canceled; carries the stake to refund.
    Canceled { refund: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: EventStatus,
    pub to: EventStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {:?} -> {:?}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionEvent {
    pub event_id: String,
    pub channel_id: String,
    pub streamer: String,
    pub title: String,
    pub status: EventStatus,
    pub prediction_window_seconds: f64,
    pub created_at: DateTime<Utc>,
    pub outcomes: Vec<Outcome>,
    pub chosen: Option<usize>,
    pub amount: u64,
    pub bet_confirmed: bool,
    pub attempts: u32,
    pub abandoned: bool,
    pub winning_outcome_id: Option<String>,
    pub result: BetResult,
    pub points_won: u64,
}

impl PredictionEvent {
    pub fn new(
        event_id: &str,
        channel_id: &str,
        streamer: &str,
        title: &str,
        prediction_window_seconds: f64,
        created_at: DateTime<Utc>,
        outcomes: Vec<Outcome>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            channel_id: channel_id.to_string(),
            streamer: streamer.to_string(),
            title: title.trim().to_string(),
            status: EventStatus::Active,
            prediction_window_seconds,
            created_at,
            outcomes,
            chosen: None,
            amount: 0,
            bet_confirmed: false,
            attempts: 0,
            abandoned: false,
            winning_outcome_id: None,
            result: BetResult::Unknown,
            points_won: 0,
        }
    }

    /// Replace outcome totals; outcomes are matched by id, new ones appended.
    pub fn update_outcomes(&mut self, outcomes: &[Outcome]) {
        for incoming in outcomes {
            match self.outcomes.iter_mut().find(|o| o.id == incoming.id) {
                Some(existing) => {
                    existing.total_points = incoming.total_points;
                    existing.total_users = incoming.total_users;
                    existing.top_points = incoming.top_points;
                    if !incoming.title.is_empty() {
                        existing.title = incoming.title.clone();
                    }
                }
                None => self.outcomes.push(incoming.clone()),
            }
        }
    }

    pub fn total_points(&self) -> u64 {
        self.outcomes.iter().map(|o| o.total_points).sum()
    }

    pub fn total_users(&self) -> u64 {
        self.outcomes.iter().map(|o| o.total_users).sum()
    }

    /// Points returned per point staked on outcome `i`; 0 when nobody bet on it.
    pub fn odds(&self, i: usize) -> f64 {
        match self.outcomes.get(i) {
            Some(o) if o.total_points > 0 => self.total_points() as f64 / o.total_points as f64,
            _ => 0.0,
        }
    }

    pub fn odds_percentage(&self, i: usize) -> f64 {
        let odds = self.odds(i);
        if odds > 0.0 {
            100.0 / odds
        } else {
            0.0
        }
    }

    pub fn percentage_users(&self, i: usize) -> f64 {
        let total = self.total_users();
        match self.outcomes.get(i) {
            Some(o) if total > 0 => o.total_users as f64 * 100.0 / total as f64,
            _ => 0.0,
        }
    }

    /// A bet can be attempted now.
    pub fn accepts_bets(&self) -> bool {
        self.status == EventStatus::Active && !self.bet_confirmed && !self.abandoned
    }

    /// Record a successful placement. Only valid while ACTIVE and unconfirmed.
    pub fn confirm_bet(&mut self, outcome_index: usize, amount: u64) -> bool {
        if !self.accepts_bets() || outcome_index >= self.outcomes.len() {
            return false;
        }
        self.chosen = Some(outcome_index);
        self.amount = amount;
        self.bet_confirmed = true;
        true
    }

    /// Record a failed attempt; returns true once the event is abandoned.
    pub fn record_failure(&mut self, max_attempts: u32) -> bool {
        self.attempts += 1;
        if self.attempts >= max_attempts {
            self.abandoned = true;
        }
        self.abandoned
    }

    /// Apply an upstream status.
    pub fn apply_status(
        &mut self,
        next: EventStatus,
        winning_outcome_id: Option<&str>,
    ) -> Result<Transition, IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        if self.status == next {
            return Ok(Transition::Unchanged);
        }
        self.status = next;
        Ok(match next {
            EventStatus::Active => Transition::Unchanged,
            EventStatus::Locked => Transition::Locked,
            EventStatus::Resolved => {
                self.winning_outcome_id = winning_outcome_id.map(str::to_string);
                Transition::Resolved {
                    payout: self.settle(),
                }
            }
            EventStatus::Canceled => {
                let refund = if self.bet_confirmed {
                    self.result = BetResult::Refund;
                    self.points_won = self.amount;
                    self.amount
                } else {
                    0
                };
                Transition::Canceled { refund }
            }
        })
    }

    /// Work out result and payout for a resolved event.
    fn settle(&mut self) -> u64 {
        let Some(chosen) = self.chosen.filter(|_| self.bet_confirmed) else {
            return 0;
        };
        let won = match (&self.winning_outcome_id, self.outcomes.get(chosen)) {
            (Some(winner), Some(outcome)) => *winner == outcome.id,
            _ => false,
        };
        if !won {
            self.result = BetResult::Lose;
            self.points_won = 0;
            return 0;
        }
        let pool = self.total_points() as u128;
        let winners = self.outcomes[chosen].total_points.max(self.amount) as u128;
        let payout = if winners == 0 {
            self.amount
        } else {
            (self.amount as u128 * pool / winners) as u64
        };
        self.result = BetResult::Win;
        self.points_won = payout;
        payout
    }

    /// Seconds after `created_at` at which to place the bet.
    pub fn bet_delay(&self, settings: &BetSettings) -> Duration {
        let window = self.prediction_window_seconds.max(0.0);
        let delay = if settings.delay.is_finite() {
            settings.delay.max(0.0)
        } else {
            0.0
        };
        let secs = match settings.delay_mode {
            DelayMode::FromStart => delay.min(window),
            DelayMode::FromEnd => (window - delay).max(0.0),
            DelayMode::Percentage => window * delay.min(1.0),
        };
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }

    /// How long from `now` until the bet should go in.
    pub fn time_until_bet(&self, settings: &BetSettings, now: DateTime<Utc>) -> Duration {
        let elapsed = (now - self.created_at).to_std().unwrap_or_default();
        self.bet_delay(settings).saturating_sub(elapsed)
    }

    /// One-line summary for the final report.
    pub fn recap(&self) -> String {
        let choice = self
            .chosen
            .and_then(|i| self.outcomes.get(i))
            .map(|o| o.title.as_str())
            .unwrap_or("-");
        format!(
            "{} ({}): {:?}, bet {} on '{}', result {:?}, won {}",
            self.title, self.streamer, self.status, self.amount, choice, self.result, self.points_won
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BetSettings;

    fn event_with(totals: &[(u64, u64)]) -> PredictionEvent {
        let outcomes = totals
            .iter()
            .enumerate()
            .map(|(i, (points, users))| Outcome {
                id: format!("o{}", i),
                title: format!("Outcome {}", i),
                total_points: *points,
                total_users: *users,
                top_points: 0,
            })
            .collect();
        PredictionEvent::new("e1", "c1", "alice", "Will it work?", 120.0, Utc::now(), outcomes)
    }

    #[test]
    fn test_odds() {
        let event = event_with(&[(100, 1), (300, 3)]);
        assert_eq!(event.odds(0), 4.0);
        assert_eq!(event.odds_percentage(0), 25.0);
        assert_eq!(event.percentage_users(1), 75.0);
        assert_eq!(event_with(&[(0, 0), (0, 0)]).odds(0), 0.0);
    }

    #[test]
    fn test_no_resolved_to_active() {
        let mut event = event_with(&[(10, 1), (10, 1)]);
        event.apply_status(EventStatus::Resolved, Some("o0")).unwrap();
        let err = event.apply_status(EventStatus::Active, None).unwrap_err();
        assert_eq!(err.from, EventStatus::Resolved);
        assert_eq!(event.status, EventStatus::Resolved);
    }

    #[test]
    fn test_locked_event_refuses_bet() {
        let mut event = event_with(&[(10, 1), (10, 1)]);
        event.apply_status(EventStatus::Locked, None).unwrap();
        assert!(!event.confirm_bet(0, 10));
        assert!(!event.bet_confirmed);
    }

    #[test]
    fn test_bet_confirmed_only_once() {
        let mut event = event_with(&[(10, 1), (10, 1)]);
        assert!(event.confirm_bet(0, 10));
        assert!(!event.confirm_bet(1, 99));
        assert_eq!(event.chosen, Some(0));
        assert_eq!(event.amount, 10);
    }

    #[test]
    fn test_win_payout() {
        let mut event = event_with(&[(0, 0), (0, 0)]);
        event.confirm_bet(0, 10);
        event.update_outcomes(&[
            Outcome { id: "o0".into(), title: String::new(), total_points: 10, total_users: 1, top_points: 10 },
            Outcome { id: "o1".into(), title: String::new(), total_points: 10, total_users: 1, top_points: 10 },
        ]);
        event.apply_status(EventStatus::Locked, None).unwrap();
        let transition = event.apply_status(EventStatus::Resolved, Some("o0")).unwrap();
        assert_eq!(transition, Transition::Resolved { payout: 20 });
        assert_eq!(event.result, BetResult::Win);
        assert_eq!(event.outcomes[0].title, "Outcome 0");
    }

    #[test]
    fn test_lose_and_refund() {
        let mut lost = event_with(&[(10, 1), (10, 1)]);
        lost.confirm_bet(1, 10);
        assert_eq!(
            lost.apply_status(EventStatus::Resolved, Some("o0")).unwrap(),
            Transition::Resolved { payout: 0 }
        );
        assert_eq!(lost.result, BetResult::Lose);

        let mut canceled = event_with(&[(10, 1), (10, 1)]);
        canceled.confirm_bet(1, 7);
        assert_eq!(
            canceled.apply_status(EventStatus::Canceled, None).unwrap(),
            Transition::Canceled { refund: 7 }
        );
        assert_eq!(canceled.result, BetResult::Refund);
    }

    #[test]
    fn test_failures_abandon_event() {
        let mut event = event_with(&[(10, 1), (10, 1)]);
        assert!(!event.record_failure(3));
        assert!(!event.record_failure(3));
        assert!(event.record_failure(3));
        assert!(!event.accepts_bets());
    }

    #[test]
    fn test_bet_delay_modes() {
        let event = event_with(&[(0, 0), (0, 0)]);
        let mut settings = BetSettings::default();
        settings.delay_mode = DelayMode::FromEnd;
        settings.delay = 6.0;
        assert_eq!(event.bet_delay(&settings), Duration::from_secs(114));
        settings.delay_mode = DelayMode::FromStart;
        settings.delay = 500.0;
        assert_eq!(event.bet_delay(&settings), Duration::from_secs(120));
        settings.delay_mode = DelayMode::Percentage;
        settings.delay = 0.5;
        assert_eq!(event.bet_delay(&settings), Duration::from_secs(60));
    }

    #[test]
    fn test_bet_delay_out_of_range_places_immediately() {
        let event = event_with(&[(0, 0), (0, 0)]);
        let mut settings = BetSettings::default();
        settings.delay_mode = DelayMode::FromStart;
        settings.delay = -5.0;
        assert_eq!(event.bet_delay(&settings), Duration::ZERO);
        settings.delay_mode = DelayMode::Percentage;
        settings.delay = f64::NAN;
        assert_eq!(event.bet_delay(&settings), Duration::ZERO);
        settings.delay_mode = DelayMode::FromEnd;
        settings.delay = f64::INFINITY;
        assert_eq!(event.bet_delay(&settings), Duration::from_secs(120));
    }
}
