//! Prediction engine: what to bet, how much, and when.
//!
//! [`decide`] is a pure function over the event and a copy of the streamer's
//! betting context. [`PredictionEngine`] wraps it with the API call, attempt
//! accounting and delayed placement.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::api::TwitchApi;
use crate::prediction::PredictionEvent;
use crate::settings::{BetSettings, OutcomeKey, Stake, Strategy};
use crate::store::EntityStore;
use crate::streamer::Streamer;
use crate::workers::Workers;

/// Placement attempts before an event is abandoned.
pub const MAX_BET_ATTEMPTS: u32 = 3;

/// Streamer state a decision needs, copied out from under the streamer guard.
#[derive(Debug, Clone)]
pub struct BetContext {
    pub username: String,
    pub balance: u64,
    pub make_predictions: bool,
    pub viewer_is_mod: bool,
    pub settings: BetSettings,
}

impl From<&Streamer> for BetContext {
    fn from(streamer: &Streamer) -> Self {
        Self {
            username: streamer.username.clone(),
            balance: streamer.channel_points,
            make_predictions: streamer.settings.make_predictions,
            viewer_is_mod: streamer.viewer_is_mod,
            settings: streamer.settings.bet.clone(),
        }
    }
}

/// Why no bet was placed. None of these are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    PredictionsDisabled,
    Moderator,
    NotAccepting,
    NoOutcomes,
    BelowMinimum { balance: u64, minimum: u64 },
    ZeroStake,
    FilterNotMet { value: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PredictionsDisabled => write!(f, "predictions disabled"),
            SkipReason::Moderator => write!(f, "viewer is a moderator"),
            SkipReason::NotAccepting => write!(f, "event no longer accepts bets"),
            SkipReason::NoOutcomes => write!(f, "event has no outcomes"),
            SkipReason::BelowMinimum { balance, minimum } => {
                write!(f, "balance {} below minimum {}", balance, minimum)
            }
            SkipReason::ZeroStake => write!(f, "stake is zero"),
            SkipReason::FilterNotMet { value } => write!(f, "filter condition not met ({})", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Place { outcome: usize, amount: u64 },
    Skip(SkipReason),
}

/// Index of the best value; ties go to the lowest index.
fn best_by(values: impl Iterator<Item = f64>, highest: bool) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, v) in values.enumerate() {
        let better = match best {
            None => true,
            Some((_, b)) if highest => v > b,
            Some((_, b)) => v < b,
        };
        if better {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Pick the outcome to bet on.
pub fn choose_outcome(event: &PredictionEvent, settings: &BetSettings) -> Option<usize> {
    let n = event.outcomes.len();
    match settings.strategy {
        Strategy::MostVoted => best_by(event.outcomes.iter().map(|o| o.total_users as f64), true),
        Strategy::HighOdds => best_by((0..n).map(|i| event.odds(i)), true),
        Strategy::LowOdds => best_by((0..n).map(|i| event.odds(i)), false),
        Strategy::Percentage => best_by((0..n).map(|i| event.odds_percentage(i)), true),
        Strategy::SmartMoney => best_by(event.outcomes.iter().map(|o| o.top_points as f64), true),
        Strategy::Smart => {
            let mut shares: Vec<f64> = (0..n).map(|i| event.percentage_users(i)).collect();
            shares.sort_by(|a, b| b.total_cmp(a));
            let gap = match shares.as_slice() {
                [first, second, ..] => first - second,
                _ => f64::MAX,
            };
            if gap < settings.percentage_gap as f64 {
                best_by((0..n).map(|i| event.odds(i)), true)
            } else {
                best_by(event.outcomes.iter().map(|o| o.total_users as f64), true)
            }
        }
    }
}

/// Value a filter condition is checked against.
pub fn outcome_value(event: &PredictionEvent, outcome: usize, key: OutcomeKey) -> f64 {
    let Some(o) = event.outcomes.get(outcome) else {
        return 0.0;
    };
    match key {
        OutcomeKey::PercentageUsers => event.percentage_users(outcome),
        OutcomeKey::OddsPercentage => event.odds_percentage(outcome),
        OutcomeKey::Odds => event.odds(outcome),
        OutcomeKey::TopPoints => o.top_points as f64,
        OutcomeKey::TotalUsers => event.total_users() as f64,
        OutcomeKey::TotalPoints => event.total_points() as f64,
        OutcomeKey::DecisionUsers => o.total_users as f64,
        OutcomeKey::DecisionPoints => o.total_points as f64,
    }
}

/// Stake for `balance`, capped by `max_points` and the balance itself.
pub fn stake_for(balance: u64, settings: &BetSettings, top_points: u64) -> u64 {
    let raw = match settings.stake {
        Stake::Fixed(points) => points,
        Stake::Percentage(p) => balance * u64::from(p.min(100)) / 100,
    };
    let mut amount = raw.min(settings.max_points).min(balance);
    if settings.stealth_mode && top_points > 0 && amount >= top_points {
        amount = top_points - 1;
    }
    amount
}

/// Decide whether and how to bet. Pure.
pub fn decide(event: &PredictionEvent, ctx: &BetContext) -> Decision {
    let settings = &ctx.settings;
    if !ctx.make_predictions {
        return Decision::Skip(SkipReason::PredictionsDisabled);
    }
    if ctx.viewer_is_mod {
        return Decision::Skip(SkipReason::Moderator);
    }
    if !event.accepts_bets() {
        return Decision::Skip(SkipReason::NotAccepting);
    }
    if ctx.balance < settings.minimum_points {
        return Decision::Skip(SkipReason::BelowMinimum {
            balance: ctx.balance,
            minimum: settings.minimum_points,
        });
    }
    let Some(outcome) = choose_outcome(event, settings) else {
        return Decision::Skip(SkipReason::NoOutcomes);
    };
    if let Some(filter) = settings.filter_condition {
        let value = outcome_value(event, outcome, filter.by);
        if !filter.condition.holds(value, filter.value) {
            return Decision::Skip(SkipReason::FilterNotMet { value });
        }
    }
    let amount = stake_for(ctx.balance, settings, event.outcomes[outcome].top_points);
    if amount == 0 {
        return Decision::Skip(SkipReason::ZeroStake);
    }
    Decision::Place { outcome, amount }
}

/// Result of one placement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Placed { outcome: usize, amount: u64 },
    Skipped(SkipReason),
    Failed { abandoned: bool },
}

pub struct PredictionEngine {
    api: Arc<dyn TwitchApi>,
    store: Arc<EntityStore>,
    max_attempts: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
    workers: Arc<Workers>,
}

impl PredictionEngine {
    pub fn new(
        api: Arc<dyn TwitchApi>,
        store: Arc<EntityStore>,
        cancel: CancellationToken,
        workers: Arc<Workers>,
    ) -> Self {
        Self {
            api,
            store,
            max_attempts: MAX_BET_ATTEMPTS,
            retry_delay: Duration::from_secs(1),
            cancel,
            workers,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Copy the betting context out of the streamer guard.
    pub async fn context(&self, channel_id: &str) -> Option<BetContext> {
        self.store
            .with_streamer(channel_id, |s| BetContext::from(&*s))
            .await
    }

    /// One placement attempt on an event the caller has locked.
    pub async fn attempt(&self, event: &mut PredictionEvent, ctx: &BetContext) -> Attempt {
        let (outcome, amount) = match decide(event, ctx) {
            Decision::Place { outcome, amount } => (outcome, amount),
            Decision::Skip(reason) => {
                tracing::info!(
                    channel = %ctx.username,
                    event = %event.event_id,
                    reason = %reason,
                    "Skipping prediction"
                );
                return Attempt::Skipped(reason);
            }
        };
        let outcome_id = event.outcomes[outcome].id.clone();
        match self.api.make_prediction(event, &outcome_id, amount).await {
            Ok(()) => {
                if event.confirm_bet(outcome, amount) {
                    self.store
                        .with_streamer(&event.channel_id, |s| s.bet_placed())
                        .await;
                }
                tracing::info!(
                    channel = %ctx.username,
                    event = %event.event_id,
                    outcome = %event.outcomes[outcome].title,
                    amount,
                    odds = event.odds(outcome),
                    "Placed prediction"
                );
                Attempt::Placed { outcome, amount }
            }
            Err(e) => {
                let abandoned = event.record_failure(self.max_attempts);
                if abandoned {
                    tracing::error!(
                        channel = %ctx.username,
                        event = %event.event_id,
                        attempts = event.attempts,
                        cause = e.cause(),
                        error = %e,
                        "Giving up on prediction"
                    );
                } else {
                    tracing::warn!(
                        channel = %ctx.username,
                        event = %event.event_id,
                        attempt = event.attempts,
                        error = %e,
                        "Prediction placement failed"
                    );
                }
                Attempt::Failed { abandoned }
            }
        }
    }

    /// Try to place on `event_id` until confirmed, skipped, abandoned or no longer active.
    pub async fn place(&self, event_id: &str) -> Option<Attempt> {
        let handle = self.store.prediction(event_id)?;
        let mut last = None;
        loop {
            let channel_id = handle.lock().await.channel_id.clone();
            let ctx = self.context(&channel_id).await?;
            let attempt = {
                let mut event = handle.lock().await;
                if !event.accepts_bets() {
                    return last;
                }
                self.attempt(&mut event, &ctx).await
            };
            let retry = matches!(attempt, Attempt::Failed { abandoned: false });
            last = Some(attempt);
            if !retry {
                return last;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return last,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Schedule placement according to the streamer's delay mode.
    pub async fn schedule(self: &Arc<Self>, event_id: &str) {
        let Some(handle) = self.store.prediction(event_id) else {
            return;
        };
        let channel_id = handle.lock().await.channel_id.clone();
        let Some(ctx) = self.context(&channel_id).await else {
            return;
        };
        let delay = handle.lock().await.time_until_bet(&ctx.settings, Utc::now());
        tracing::info!(
            channel = %ctx.username,
            event = %event_id,
            delay_secs = delay.as_secs_f64(),
            "Prediction scheduled"
        );

        let engine = Arc::clone(self);
        let event_id = event_id.to_string();
        self.workers.spawn(async move {
            tokio::select! {
                _ = engine.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            engine.place(&event_id).await;
        });
    }
}
