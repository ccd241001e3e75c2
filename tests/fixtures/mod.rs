//! Shared test fixtures for pool, dispatcher and session integration tests.
//!
//! Provides an in-memory connector whose links can be fed frames and made to
//! fail, a scripted Twitch API, and builders for streamers and pubsub frames.

#![allow(dead_code)]

use async_trait::async_trait;
use pointsminer::api::TwitchApi;
use pointsminer::chat::ChatPresence;
use pointsminer::drops::DropCampaign;
use pointsminer::error::{MinerError, Result};
use pointsminer::liveness::NetworkProbe;
use pointsminer::pool::{Control, FrameHandler};
use pointsminer::prediction::PredictionEvent;
use pointsminer::streamer::Streamer;
use pointsminer::transport::{Connector, FrameSink, FrameSource, Link};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Frames sent on each link, by link number (order of `connect` calls).
type Sent = Arc<Mutex<Vec<(usize, String)>>>;

/// In-memory connector. Link `n` is the n-th successful `connect`.
#[derive(Default)]
pub struct MockConnector {
    attempts: AtomicUsize,
    links: AtomicUsize,
    fail_next: AtomicUsize,
    connect_delay: Mutex<Duration>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    sent: Sent,
    inbound: Mutex<Vec<mpsc::UnboundedSender<Option<String>>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Make every LISTEN for `wire_name` fail until `allow_listen`.
    pub fn fail_listen(&self, wire_name: &str) {
        self.failing_topics.lock().unwrap().insert(wire_name.to_string());
    }

    pub fn allow_listen(&self, wire_name: &str) {
        self.failing_topics.lock().unwrap().remove(wire_name);
    }

    pub fn sent(&self) -> Vec<(usize, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Topic names LISTENed on `link`, in send order.
    pub fn listens_on(&self, link: usize) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(l, _)| *l == link)
            .flat_map(|(_, frame)| listen_topics(&frame))
            .collect()
    }

    /// Topic names LISTENed on any link.
    pub fn listens(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .flat_map(|(_, frame)| listen_topics(&frame))
            .collect()
    }

    /// Deliver a frame to `link`.
    pub fn push(&self, link: usize, frame: impl Into<String>) {
        if let Some(tx) = self.inbound.lock().unwrap().get(link) {
            tx.send(Some(frame.into())).ok();
        }
    }

    /// Close `link` from the server side.
    pub fn close(&self, link: usize) {
        if let Some(tx) = self.inbound.lock().unwrap().get(link) {
            tx.send(None).ok();
        }
    }
}

fn listen_topics(frame: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(frame) else {
        return Vec::new();
    };
    if value["type"] != "LISTEN" {
        return Vec::new();
    }
    value["data"]["topics"]
        .as_array()
        .map(|topics| {
            topics
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self.fail_next.load(Ordering::SeqCst);
        if failing > 0 {
            self.fail_next.store(failing - 1, Ordering::SeqCst);
            return Err(MinerError::Transport("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link = {
            let mut inbound = self.inbound.lock().unwrap();
            inbound.push(tx);
            inbound.len() - 1
        };
        self.links.fetch_add(1, Ordering::SeqCst);
        Ok(Link {
            sink: Box::new(MockSink {
                link,
                sent: self.sent.clone(),
                failing_topics: self.failing_topics.clone(),
                closed: false,
            }),
            source: Box::new(MockSource { rx }),
        })
    }
}

struct MockSink {
    link: usize,
    sent: Sent,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed {
            return Err(MinerError::Transport("link closed".into()));
        }
        let rejected = {
            let failing = self.failing_topics.lock().unwrap();
            listen_topics(&frame).iter().any(|t| failing.contains(t))
        };
        if rejected {
            return Err(MinerError::Transport("write failed".into()));
        }
        self.sent.lock().unwrap().push((self.link, frame));
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Option<String>>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        match self.rx.recv().await {
            Some(Some(frame)) => Some(Ok(frame)),
            _ => None,
        }
    }
}

/// Records frames; asks for a reconnect on `RECONNECT`.
#[derive(Default)]
pub struct RecordingHandler {
    frames: Mutex<Vec<(usize, String)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<(usize, String)> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl FrameHandler for RecordingHandler {
    async fn on_frame(&self, connection: usize, raw: &str) -> Control {
        self.frames.lock().unwrap().push((connection, raw.to_string()));
        if raw.contains("RECONNECT") {
            Control::Reconnect
        } else {
            Control::Continue
        }
    }
}

pub struct MockProbe {
    reachable: AtomicBool,
}

impl MockProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkProbe for MockProbe {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MockChannel {
    pub channel_id: String,
    pub points: u64,
    pub online: bool,
}

/// Scripted API. Unknown logins resolve to `EntityNotFound`.
pub struct MockApi {
    login: String,
    user_id: String,
    channels: Mutex<HashMap<String, MockChannel>>,
    followers: Mutex<Vec<String>>,
    predictions: Mutex<Vec<(String, String, u64)>>,
    heartbeats: Mutex<Vec<String>>,
    failing_predictions: AtomicUsize,
    campaigns: Mutex<Vec<DropCampaign>>,
    drops_claimed: AtomicUsize,
}

impl MockApi {
    pub fn new(login: &str, user_id: &str) -> Self {
        Self {
            login: login.to_string(),
            user_id: user_id.to_string(),
            channels: Mutex::new(HashMap::new()),
            followers: Mutex::new(Vec::new()),
            predictions: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
            failing_predictions: AtomicUsize::new(0),
            campaigns: Mutex::new(Vec::new()),
            drops_claimed: AtomicUsize::new(0),
        }
    }

    pub fn with_channel(self, login: &str, channel_id: &str, points: u64, online: bool) -> Self {
        self.channels.lock().unwrap().insert(
            login.to_string(),
            MockChannel {
                channel_id: channel_id.to_string(),
                points,
                online,
            },
        );
        self
    }

    pub fn set_followers(&self, logins: &[&str]) {
        *self.followers.lock().unwrap() = logins.iter().map(|l| l.to_string()).collect();
    }

    /// The next `n` placements fail.
    pub fn fail_predictions(&self, n: usize) {
        self.failing_predictions.store(n, Ordering::SeqCst);
    }

    /// `(event_id, outcome_id, amount)` per successful placement.
    pub fn predictions(&self) -> Vec<(String, String, u64)> {
        self.predictions.lock().unwrap().clone()
    }

    pub fn set_campaigns(&self, campaigns: Vec<DropCampaign>) {
        *self.campaigns.lock().unwrap() = campaigns;
    }

    /// Times the inventory was asked to claim finished drops.
    pub fn drops_claimed(&self) -> usize {
        self.drops_claimed.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> Vec<String> {
        self.heartbeats.lock().unwrap().clone()
    }

    fn channel(&self, login: &str) -> Option<MockChannel> {
        self.channels.lock().unwrap().get(login).cloned()
    }
}

#[async_trait]
impl TwitchApi for MockApi {
    fn login(&self) -> &str {
        &self.login
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn auth_token(&self) -> &str {
        "token"
    }

    async fn get_channel_id(&self, login: &str) -> Result<String> {
        self.channel(login)
            .map(|c| c.channel_id)
            .ok_or_else(|| MinerError::EntityNotFound(login.to_string()))
    }

    async fn load_channel_points_context(&self, streamer: &mut Streamer) -> Result<()> {
        let channel = self
            .channel(&streamer.username)
            .ok_or_else(|| MinerError::EntityNotFound(streamer.username.clone()))?;
        streamer.channel_points = channel.points;
        Ok(())
    }

    async fn check_streamer_online(&self, streamer: &mut Streamer) -> Result<()> {
        match self.channel(&streamer.username) {
            Some(c) if c.online => streamer.set_online(),
            _ => streamer.set_offline(),
        }
        Ok(())
    }

    async fn viewer_is_mod(&self, _streamer: &Streamer) -> Result<bool> {
        Ok(false)
    }

    async fn make_prediction(&self, event: &PredictionEvent, outcome_id: &str, amount: u64) -> Result<()> {
        let failing = self.failing_predictions.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_predictions.store(failing - 1, Ordering::SeqCst);
            return Err(MinerError::BetPlacement {
                event_id: event.event_id.clone(),
                reason: "service unavailable".into(),
            });
        }
        self.predictions
            .lock()
            .unwrap()
            .push((event.event_id.clone(), outcome_id.to_string(), amount));
        Ok(())
    }

    async fn send_minute_watched(&self, streamer: &Streamer) -> Result<()> {
        self.heartbeats.lock().unwrap().push(streamer.channel_id.clone());
        Ok(())
    }

    async fn get_followers(&self) -> Result<Vec<String>> {
        Ok(self.followers.lock().unwrap().clone())
    }

    async fn claim_bonus(&self, _streamer: &Streamer, _claim_id: &str) -> Result<()> {
        Ok(())
    }

    async fn join_raid(&self, _raid_id: &str) -> Result<()> {
        Ok(())
    }

    async fn claim_available_rewards(&self) -> Result<usize> {
        self.drops_claimed.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn drop_campaigns(&self) -> Result<Vec<DropCampaign>> {
        Ok(self.campaigns.lock().unwrap().clone())
    }
}

/// Chat presence that only records joins and leaves.
#[derive(Default)]
pub struct MockChat {
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatPresence for MockChat {
    async fn join(&self, channel: &str) -> Result<()> {
        self.joined.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        self.left.lock().unwrap().push(channel.to_string());
        Ok(())
    }
}

/// A loaded streamer.
pub fn streamer(username: &str, channel_id: &str, points: u64, online: bool) -> Streamer {
    let mut s = Streamer::new(username);
    s.channel_id = channel_id.to_string();
    s.channel_points = points;
    if online {
        s.set_online();
    }
    s.init_processed = true;
    s
}

/// A `MESSAGE` frame wrapping `inner` for `topic`.
pub fn message(topic: &str, inner: serde_json::Value) -> String {
    json!({
        "type": "MESSAGE",
        "data": { "topic": topic, "message": inner.to_string() }
    })
    .to_string()
}

pub fn points_earned(user_id: &str, channel_id: &str, gained: u64, reason: &str, balance: u64) -> String {
    message(
        &format!("community-points-user-v1.{}", user_id),
        json!({
            "type": "points-earned",
            "data": {
                "channel_id": channel_id,
                "point_gain": { "total_points": gained, "reason_code": reason },
                "balance": { "channel_id": channel_id, "balance": balance }
            }
        }),
    )
}

pub fn points_spent(user_id: &str, channel_id: &str, balance: u64) -> String {
    message(
        &format!("community-points-user-v1.{}", user_id),
        json!({
            "type": "points-spent",
            "data": { "balance": { "channel_id": channel_id, "balance": balance } }
        }),
    )
}

/// An event frame. `kind` is `event-created` or `event-updated`;
/// each outcome is `(id, total_points, total_users)`.
pub fn event_frame(
    kind: &str,
    channel_id: &str,
    event_id: &str,
    status: &str,
    outcomes: &[(&str, u64, u64)],
    winner: Option<&str>,
) -> String {
    let outcomes: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|(id, points, users)| {
            json!({
                "id": id,
                "title": format!("Outcome {}", id),
                "total_points": points,
                "total_users": users,
                "top_predictors": []
            })
        })
        .collect();
    message(
        &format!("predictions-channel-v1.{}", channel_id),
        json!({
            "type": kind,
            "data": { "event": {
                "id": event_id,
                "channel_id": channel_id,
                "title": "Will it work?",
                "status": status,
                "prediction_window_seconds": 120,
                "created_at": chrono::Utc::now().to_rfc3339(),
                "outcomes": outcomes,
                "winning_outcome_id": winner
            }}
        }),
    )
}

/// Poll `check` every few milliseconds until it holds or `within` passes.
pub async fn wait_for<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
