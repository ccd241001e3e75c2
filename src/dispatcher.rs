//! Inbound pubsub frame decoding and routing.
//!
//! Frames are decoded into [`Frame`] and, for `MESSAGE`, into a
//! [`PubsubMessage`]. Malformed frames and frames about unknown entities are
//! logged and dropped; nothing here ever propagates an error to the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::TwitchApi;
use crate::bet::{Attempt, PredictionEngine};
use crate::error::{MinerError, Result};
use crate::pool::{Control, FrameHandler};
use crate::prediction::{BetResult, EventStatus, Outcome, PredictionEvent, Transition};
use crate::store::{EntityStore, StreamerHandle};
use crate::streamer::Raid;
use crate::topic::Topic;
use crate::workers::Workers;

/// Outer frame envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum RawFrame {
    Pong,
    Reconnect,
    Response {
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Message {
        data: RawMessageData,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawMessageData {
    topic: String,
    /// JSON encoded as a string.
    message: String,
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    Pong,
    Reconnect,
    Response {
        nonce: Option<String>,
        error: Option<String>,
    },
    Message {
        topic: Topic,
        message: PubsubMessage,
    },
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct PointGain {
    #[serde(default)]
    pub total_points: i64,
    #[serde(default)]
    pub reason_code: String,
}

#[derive(Debug, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub channel_id: String,
    pub balance: u64,
}

#[derive(Debug, Deserialize)]
pub struct PointsEarned {
    pub channel_id: String,
    pub point_gain: PointGain,
    pub balance: Balance,
}

#[derive(Debug, Deserialize)]
pub struct PointsSpent {
    pub balance: Balance,
}

#[derive(Debug, Deserialize)]
pub struct Claim {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaimAvailable {
    pub claim: Claim,
}

#[derive(Debug, Deserialize)]
pub struct TopPredictor {
    #[serde(default)]
    pub points: u64,
}

#[derive(Debug, Deserialize)]
pub struct RawOutcome {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub total_points: u64,
    #[serde(default)]
    pub total_users: u64,
    #[serde(default)]
    pub top_predictors: Vec<TopPredictor>,
}

impl From<&RawOutcome> for Outcome {
    fn from(raw: &RawOutcome) -> Self {
        Outcome {
            id: raw.id.clone(),
            title: raw.title.clone(),
            total_points: raw.total_points,
            total_users: raw.total_users,
            top_points: raw.top_predictors.iter().map(|p| p.points).max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub prediction_window_seconds: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: Vec<RawOutcome>,
    #[serde(default)]
    pub winning_outcome_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub event: RawEvent,
}

#[derive(Debug, Deserialize)]
pub struct RawPredictionResult {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub points_won: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct UserPrediction {
    pub event_id: String,
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub result: Option<RawPredictionResult>,
}

#[derive(Debug, Deserialize)]
pub struct UserPredictionData {
    pub prediction: UserPrediction,
}

#[derive(Debug, Deserialize)]
pub struct RawRaid {
    pub id: String,
    pub target_login: String,
}

/// Inner message of a `MESSAGE` frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PubsubMessage {
    #[serde(rename = "points-earned")]
    PointsEarned { data: PointsEarned },
    #[serde(rename = "points-spent")]
    PointsSpent { data: PointsSpent },
    #[serde(rename = "claim-available")]
    ClaimAvailable { data: ClaimAvailable },
    #[serde(rename = "stream-up")]
    StreamUp,
    #[serde(rename = "stream-down")]
    StreamDown,
    #[serde(rename = "viewcount")]
    ViewCount {
        #[serde(default)]
        viewers: u64,
    },
    #[serde(rename = "event-created")]
    EventCreated { data: EventData },
    #[serde(rename = "event-updated")]
    EventUpdated { data: EventData },
    #[serde(rename = "prediction-result")]
    PredictionResult { data: UserPredictionData },
    #[serde(rename = "prediction-made")]
    PredictionMade { data: UserPredictionData },
    #[serde(rename = "raid_update_v2")]
    RaidUpdate { raid: RawRaid },
    #[serde(other)]
    Unknown,
}

/// Decode one raw frame.
pub fn decode(raw: &str) -> Result<Frame> {
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|e| MinerError::Protocol(format!("frame: {}", e)))?;
    Ok(match frame {
        RawFrame::Pong => Frame::Pong,
        RawFrame::Reconnect => Frame::Reconnect,
        RawFrame::Response { nonce, error } => Frame::Response { nonce, error },
        RawFrame::Unknown => Frame::Unknown,
        RawFrame::Message { data } => {
            let topic = Topic::parse(&data.topic)
                .ok_or_else(|| MinerError::Protocol(format!("unknown topic {}", data.topic)))?;
            let message = serde_json::from_str(&data.message)
                .map_err(|e| MinerError::Protocol(format!("{}: {}", topic, e)))?;
            Frame::Message { topic, message }
        }
    })
}

/// Routes decoded frames into the store and the prediction engine.
pub struct Dispatcher {
    store: Arc<EntityStore>,
    engine: Arc<PredictionEngine>,
    api: Arc<dyn TwitchApi>,
    workers: Arc<Workers>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<EntityStore>,
        engine: Arc<PredictionEngine>,
        api: Arc<dyn TwitchApi>,
        workers: Arc<Workers>,
    ) -> Self {
        Self {
            store,
            engine,
            api,
            workers,
        }
    }

    /// Decode and apply one frame.
    pub async fn dispatch(&self, raw: &str) -> Control {
        let frame = match decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(cause = e.cause(), error = %e, "Dropping malformed frame");
                return Control::Continue;
            }
        };
        match frame {
            Frame::Pong => Control::Continue,
            Frame::Reconnect => Control::Reconnect,
            Frame::Response { nonce, error } => {
                if let Some(error) = error.filter(|e| !e.is_empty()) {
                    tracing::warn!(nonce = ?nonce, error = %error, "LISTEN rejected");
                }
                Control::Continue
            }
            Frame::Unknown => {
                tracing::debug!(frame = raw, "Unknown frame type");
                Control::Continue
            }
            Frame::Message { topic, message } => {
                self.route(&topic, message).await;
                Control::Continue
            }
        }
    }

    fn streamer_for(&self, channel_id: &str, topic: &Topic) -> Option<StreamerHandle> {
        let handle = self.store.get(channel_id);
        if handle.is_none() {
            tracing::debug!(topic = %topic, channel_id, "Frame for untracked channel");
        }
        handle
    }

    async fn route(&self, topic: &Topic, message: PubsubMessage) {
        let topic_channel = topic.entity_ref.clone().unwrap_or_default();
        match message {
            PubsubMessage::PointsEarned { data } => {
                let Some(handle) = self.streamer_for(&data.channel_id, topic) else {
                    return;
                };
                let gain = data.point_gain;
                let mut streamer = handle.lock().await;
                // Payouts and refunds are recorded when the event settles.
                match gain.reason_code.as_str() {
                    "PREDICTION" | "REFUND" => {
                        streamer.apply_settlement_balance(data.balance.balance, gain.total_points)
                    }
                    reason => streamer.apply_balance(data.balance.balance, Some((reason, gain.total_points))),
                }
                tracing::info!(
                    channel = %streamer.username,
                    gained = gain.total_points,
                    reason = %gain.reason_code,
                    balance = streamer.channel_points,
                    "Points earned"
                );
            }
            PubsubMessage::PointsSpent { data } => {
                let Some(handle) = self.streamer_for(&data.balance.channel_id, topic) else {
                    return;
                };
                let mut streamer = handle.lock().await;
                streamer.apply_balance(data.balance.balance, None);
                tracing::debug!(channel = %streamer.username, balance = streamer.channel_points, "Points spent");
            }
            PubsubMessage::ClaimAvailable { data } => {
                let Some(handle) = self.streamer_for(&data.claim.channel_id, topic) else {
                    return;
                };
                let streamer = handle.lock().await.clone();
                let api = self.api.clone();
                self.workers.spawn(async move {
                    if let Err(e) = api.claim_bonus(&streamer, &data.claim.id).await {
                        tracing::warn!(channel = %streamer.username, error = %e, "Bonus claim failed");
                    }
                });
            }
            PubsubMessage::StreamUp => {
                let Some(handle) = self.streamer_for(&topic_channel, topic) else {
                    return;
                };
                handle.lock().await.set_online();
                self.refresh_stream(handle);
            }
            PubsubMessage::ViewCount { viewers } => {
                let Some(handle) = self.streamer_for(&topic_channel, topic) else {
                    return;
                };
                let came_online = {
                    let mut streamer = handle.lock().await;
                    streamer.stream.viewers = viewers;
                    let was_online = streamer.is_online;
                    streamer.set_online();
                    !was_online
                };
                if came_online {
                    self.refresh_stream(handle);
                }
            }
            PubsubMessage::StreamDown => {
                let Some(handle) = self.streamer_for(&topic_channel, topic) else {
                    return;
                };
                handle.lock().await.set_offline();
            }
            PubsubMessage::RaidUpdate { raid } => {
                let Some(handle) = self.streamer_for(&topic_channel, topic) else {
                    return;
                };
                let raid = Raid {
                    raid_id: raid.id,
                    target_login: raid.target_login,
                };
                let follow = {
                    let mut streamer = handle.lock().await;
                    if streamer.raid.as_ref() == Some(&raid) {
                        return;
                    }
                    tracing::info!(channel = %streamer.username, target = %raid.target_login, "Raid started");
                    streamer.raid = Some(raid.clone());
                    streamer.settings.follow_raid
                };
                if follow {
                    let api = self.api.clone();
                    self.workers.spawn(async move {
                        if let Err(e) = api.join_raid(&raid.raid_id).await {
                            tracing::warn!(target = %raid.target_login, error = %e, "Join raid failed");
                        }
                    });
                }
            }
            PubsubMessage::EventCreated { data } | PubsubMessage::EventUpdated { data } => {
                self.on_event(topic, data.event).await;
            }
            PubsubMessage::PredictionResult { data } => {
                let prediction = data.prediction;
                let Some(handle) = self.store.prediction(&prediction.event_id) else {
                    tracing::debug!(event = %prediction.event_id, "Result for unknown event");
                    return;
                };
                let Some(result) = prediction.result else {
                    return;
                };
                let mut event = handle.lock().await;
                event.result = BetResult::parse(&result.kind);
                if let Some(won) = result.points_won {
                    event.points_won = won;
                }
                tracing::info!(
                    channel = %event.streamer,
                    event = %event.event_id,
                    result = ?event.result,
                    points_won = event.points_won,
                    "Prediction result"
                );
            }
            PubsubMessage::PredictionMade { data } => {
                tracing::info!(
                    event = %data.prediction.event_id,
                    points = data.prediction.points,
                    "Prediction confirmed upstream"
                );
            }
            PubsubMessage::Unknown => {
                tracing::debug!(topic = %topic, "Unhandled message type");
            }
        }
    }

    /// Create-if-absent, update totals, and drive the event's state machine.
    async fn on_event(&self, topic: &Topic, raw: RawEvent) {
        let Some(next) = EventStatus::parse(&raw.status) else {
            tracing::warn!(event = %raw.id, status = %raw.status, "Unknown event status");
            return;
        };
        let Some(ctx) = self.engine.context(&raw.channel_id).await else {
            tracing::debug!(topic = %topic, channel_id = %raw.channel_id, "Event for untracked channel");
            return;
        };
        let outcomes: Vec<Outcome> = raw.outcomes.iter().map(Outcome::from).collect();

        let (handle, created) = self.store.upsert_prediction(&raw.id, || {
            PredictionEvent::new(
                &raw.id,
                &raw.channel_id,
                &ctx.username,
                &raw.title,
                raw.prediction_window_seconds,
                raw.created_at.unwrap_or_else(Utc::now),
                outcomes.clone(),
            )
        });

        let (transition, confirmed) = {
            let mut event = handle.lock().await;
            if !created {
                event.update_outcomes(&outcomes);
            }
            if !created
                && event.status == EventStatus::Active
                && next != EventStatus::Active
                && event.accepts_bets()
            {
                if let Attempt::Placed { amount, .. } = self.engine.attempt(&mut event, &ctx).await {
                    tracing::info!(event = %event.event_id, amount, "Placed before lock");
                }
            }
            match event.apply_status(next, raw.winning_outcome_id.as_deref()) {
                Ok(transition) => (transition, event.bet_confirmed),
                Err(illegal) => {
                    tracing::warn!(event = %event.event_id, "Ignoring update: {}", illegal);
                    return;
                }
            }
        };

        if created {
            tracing::info!(
                channel = %ctx.username,
                event = %raw.id,
                title = %raw.title.trim(),
                window_secs = raw.prediction_window_seconds,
                "New prediction"
            );
            if next == EventStatus::Active && ctx.make_predictions {
                self.engine.schedule(&raw.id).await;
            }
        }

        match transition {
            Transition::Resolved { payout } if confirmed => {
                let settled = self
                    .store
                    .with_streamer(&raw.channel_id, |s| (s.settle_bet("PREDICTION", payout), s.channel_points))
                    .await;
                let event = handle.lock().await;
                tracing::info!(
                    channel = %ctx.username,
                    event = %event.event_id,
                    result = ?event.result,
                    payout,
                    credited = ?settled.map(|(credited, _)| credited),
                    balance = ?settled.map(|(_, balance)| balance),
                    "Prediction resolved"
                );
            }
            Transition::Canceled { refund } if confirmed => {
                let credited = self
                    .store
                    .with_streamer(&raw.channel_id, |s| s.settle_bet("REFUND", refund))
                    .await;
                tracing::info!(
                    channel = %ctx.username,
                    event = %raw.id,
                    refund,
                    credited = ?credited,
                    "Prediction canceled, stake refunded"
                );
            }
            Transition::Resolved { .. } | Transition::Canceled { .. } => {
                tracing::debug!(event = %raw.id, status = ?next, "Event settled without a bet");
            }
            Transition::Locked => {
                tracing::debug!(event = %raw.id, "Prediction locked");
            }
            Transition::Unchanged => {}
        }
    }

    /// Fetch stream metadata without holding the streamer guard across the call.
    fn refresh_stream(&self, handle: StreamerHandle) {
        let api = self.api.clone();
        self.workers.spawn(async move {
            let mut copy = handle.lock().await.clone();
            if let Err(e) = api.check_streamer_online(&mut copy).await {
                tracing::warn!(channel = %copy.username, error = %e, "Stream info refresh failed");
                return;
            }
            let mut streamer = handle.lock().await;
            streamer.stream.broadcast_id = copy.stream.broadcast_id;
            streamer.stream.title = copy.stream.title;
            streamer.stream.game = copy.stream.game;
            streamer.stream.viewers = copy.stream.viewers;
            if copy.is_online {
                streamer.set_online();
            } else {
                streamer.set_offline();
            }
        });
    }
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn on_frame(&self, connection: usize, raw: &str) -> Control {
        tracing::trace!(connection, frame = raw, "Frame received");
        self.dispatch(raw).await
    }
}
