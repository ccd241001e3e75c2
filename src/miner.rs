//! Main control loop for the miner.

use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::TwitchApi;
use crate::bet::PredictionEngine;
use crate::chat::ChatPresence;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::drops::{self, DropsSync};
use crate::error::{MinerError, Result};
use crate::liveness::{self, NetworkProbe, STALE_AFTER};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::report::{Session, SessionReport};
use crate::settings::{Priority, SettingsOverrides, StreamerSettings};
use crate::store::EntityStore;
use crate::streamer::Streamer;
use crate::topic::{Topic, TopicKind};
use crate::tracking::{TrackedStreamer, TrackingFile};
use crate::watcher::MinuteWatcher;
use crate::workers::Workers;

/// Where streamers come from.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub streamers: Vec<String>,
    pub tracking_file: Option<TrackingFile>,
    pub blacklist: Vec<String>,
    pub followers: bool,
}

impl Sources {
    pub fn from_config(config: &Config) -> Self {
        Self {
            streamers: config.streamers.clone(),
            tracking_file: config.tracking_file.clone().map(TrackingFile::new),
            blacklist: config.blacklist.clone(),
            followers: config.followers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MinerOptions {
    pub defaults: StreamerSettings,
    pub priority: Vec<Priority>,
    pub refresh: Option<Duration>,
    pub claim_drops_startup: bool,
    /// The liveness sweep runs at a random point in this range.
    pub sweep_interval: (Duration, Duration),
    pub stale_after: Duration,
    /// Bound on each wait during shutdown.
    pub shutdown_wait: Duration,
    pub heartbeat_interval: Duration,
    pub drops_interval: Duration,
    pub pool: PoolSettings,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self {
            defaults: StreamerSettings::default(),
            priority: Priority::default_list(),
            refresh: None,
            claim_drops_startup: false,
            sweep_interval: (Duration::from_secs(20), Duration::from_secs(60)),
            stale_after: STALE_AFTER,
            shutdown_wait: Duration::from_secs(5),
            heartbeat_interval: crate::watcher::TICK,
            drops_interval: drops::SYNC_INTERVAL,
            pool: PoolSettings::default(),
        }
    }
}

impl MinerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: config.defaults.clone(),
            priority: config.priority.clone(),
            refresh: config.refresh_minutes.map(|m| Duration::from_secs(m * 60)),
            claim_drops_startup: config.claim_drops_startup,
            ..Self::default()
        }
    }
}

/// Usernames each dynamic source produced on its last load.
#[derive(Debug, Default)]
struct SourceState {
    tracking: Vec<String>,
    followers: Vec<String>,
}

pub struct Miner {
    api: Arc<dyn TwitchApi>,
    probe: Arc<dyn NetworkProbe>,
    chat: Option<Arc<dyn ChatPresence>>,
    store: Arc<EntityStore>,
    workers: Arc<Workers>,
    pool: Arc<ConnectionPool>,
    cancel: CancellationToken,
    session: Session,
    base_points: DashMap<String, u64>,
    sources: Sources,
    source_state: Mutex<SourceState>,
    options: MinerOptions,
    /// Topics whose subscription failed, retried on every sweep.
    pending: Mutex<Vec<Topic>>,
    stopped: AtomicBool,
}

impl Miner {
    pub fn new(
        api: Arc<dyn TwitchApi>,
        connector: Arc<dyn crate::transport::Connector>,
        probe: Arc<dyn NetworkProbe>,
        chat: Option<Arc<dyn ChatPresence>>,
        sources: Sources,
        options: MinerOptions,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let store = Arc::new(EntityStore::new());
        let workers = Arc::new(Workers::new());
        let engine = Arc::new(PredictionEngine::new(
            api.clone(),
            store.clone(),
            cancel.clone(),
            workers.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            engine,
            api.clone(),
            workers.clone(),
        ));
        let pool = ConnectionPool::new(
            connector,
            dispatcher,
            api.auth_token(),
            options.pool.clone(),
            cancel.child_token(),
        );
        Arc::new(Self {
            api,
            probe,
            chat,
            store,
            workers,
            pool,
            cancel,
            session: Session::start(),
            base_points: DashMap::new(),
            sources,
            source_state: Mutex::new(SourceState::default()),
            options,
            pending: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    /// Cancelling this token stops the miner.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Merge every source into the active set, load new streamers, drop missing ones.
    ///
    /// Returns the channel ids of streamers added by this call.
    pub async fn reload_streamers(&self) -> Result<Vec<String>> {
        let blacklist = &self.sources.blacklist;
        let mut names: Vec<String> = Vec::new();
        let mut overrides: HashMap<String, SettingsOverrides> = HashMap::new();
        let mut removed: Vec<(String, &'static str)> = Vec::new();
        let push = |names: &mut Vec<String>, name: String| {
            if !blacklist.contains(&name) && !names.contains(&name) {
                names.push(name);
            }
        };

        for name in self.store.usernames() {
            push(&mut names, name);
        }
        for name in &self.sources.streamers {
            push(&mut names, name.trim().to_lowercase());
        }
        tracing::info!(count = self.sources.streamers.len(), "Loaded streamers from list");

        let mut state = self.source_state.lock().await;
        if let Some(file) = &self.sources.tracking_file {
            let entries = file.load().await?;
            let loaded: Vec<String> = entries.iter().map(|e| e.username.clone()).collect();
            for entry in entries {
                overrides.insert(entry.username.clone(), entry.settings);
                push(&mut names, entry.username);
            }
            for gone in state.tracking.iter().filter(|u| !loaded.contains(*u)) {
                removed.push((gone.clone(), "not present in tracking file"));
            }
            tracing::info!(count = loaded.len(), path = %file.path().display(), "Loaded streamers from tracking file");
            state.tracking = loaded;
        }
        if self.sources.followers {
            let followed: Vec<String> = self
                .api
                .get_followers()
                .await?
                .into_iter()
                .filter(|u| !blacklist.contains(u))
                .collect();
            for name in &followed {
                push(&mut names, name.clone());
            }
            for gone in state.followers.iter().filter(|u| !followed.contains(*u)) {
                removed.push((gone.clone(), "unfollowed"));
            }
            tracing::info!(count = followed.len(), "Loaded streamers from followers");
            state.followers = followed;
        }
        drop(state);

        for (username, reason) in &removed {
            names.retain(|n| n != username);
            let Some(handle) = self.store.get_by_login(username) else {
                continue;
            };
            let channel_id = handle.lock().await.channel_id.clone();
            if self.store.remove(&channel_id).await.is_some() {
                tracing::info!(channel = %username, reason, "Removed streamer");
                if let Some(chat) = &self.chat {
                    chat.leave(username).await.ok();
                }
            }
        }

        let fresh: Vec<&String> = names.iter().filter(|n| !self.store.contains_login(n)).collect();
        tracing::info!(count = fresh.len(), "Loading data for new streamers");

        let mut added = Vec::new();
        let mut missing = Vec::new();
        for username in &names {
            let declared = overrides.get(username).cloned();
            if let Some(handle) = self.store.get_by_login(username) {
                if let Some(declared) = declared {
                    let mut streamer = handle.lock().await;
                    streamer.overrides = declared;
                    streamer.apply_defaults(&self.options.defaults);
                }
                continue;
            }
            match self.load_streamer(username, declared.unwrap_or_default()).await {
                Ok(streamer) => {
                    self.base_points
                        .entry(streamer.username.clone())
                        .or_insert(streamer.channel_points);
                    added.push(streamer.channel_id.clone());
                    self.store.insert(streamer);
                }
                Err(MinerError::EntityNotFound(_)) => {
                    tracing::info!(channel = %username, "Streamer does not exist");
                    missing.push(username.clone());
                }
                Err(e) => {
                    tracing::warn!(channel = %username, cause = e.cause(), error = %e, "Could not load streamer");
                    missing.push(username.clone());
                }
            }
        }
        names.retain(|n| !missing.contains(n));
        self.store.set_order(&names);

        if let Some(file) = &self.sources.tracking_file {
            let mut entries = Vec::with_capacity(names.len());
            for username in &names {
                let settings = match self.store.get_by_login(username) {
                    Some(handle) => handle.lock().await.overrides.clone(),
                    None => continue,
                };
                entries.push(TrackedStreamer {
                    username: username.clone(),
                    settings,
                });
            }
            file.save(&entries).await?;
        }
        Ok(added)
    }

    async fn load_streamer(&self, username: &str, overrides: SettingsOverrides) -> Result<Streamer> {
        let mut streamer = Streamer::with_overrides(username, overrides);
        streamer.channel_id = self.api.get_channel_id(&streamer.username).await?;
        streamer.apply_defaults(&self.options.defaults);
        self.api.load_channel_points_context(&mut streamer).await?;
        self.api.check_streamer_online(&mut streamer).await?;
        streamer.viewer_is_mod = self.api.viewer_is_mod(&streamer).await?;
        streamer.apply_defaults(&self.options.defaults);
        streamer.init_processed = true;
        tracing::info!(
            channel = %streamer.username,
            points = streamer.channel_points,
            online = streamer.is_online,
            moderator = streamer.viewer_is_mod,
            "Loaded streamer"
        );
        Ok(streamer)
    }

    /// Subscribe the user topics and the channel topics of `channel_ids`.
    ///
    /// A topic that cannot be bound is kept pending and retried by the sweep
    /// loop; it never stops the other subscriptions.
    pub async fn subscribe(&self, channel_ids: &[String]) {
        let user_id = self.api.user_id();
        self.submit_or_defer(Topic::user(TopicKind::CommunityPointsUser, user_id))
            .await;

        let mut any_predictions = false;
        for handle in self.store.streamers() {
            any_predictions |= handle.lock().await.settings.make_predictions;
        }
        if any_predictions {
            self.submit_or_defer(Topic::user(TopicKind::PredictionsUser, user_id))
                .await;
        }

        for channel_id in channel_ids {
            let Some(handle) = self.store.get(channel_id) else {
                continue;
            };
            let (username, settings) = {
                let streamer = handle.lock().await;
                (streamer.username.clone(), streamer.settings.clone())
            };
            self.submit_or_defer(Topic::channel(TopicKind::VideoPlayback, channel_id))
                .await;
            if settings.follow_raid {
                self.submit_or_defer(Topic::channel(TopicKind::Raid, channel_id))
                    .await;
            }
            if settings.make_predictions {
                self.submit_or_defer(Topic::channel(TopicKind::PredictionsChannel, channel_id))
                    .await;
            }
            if settings.join_chat {
                if let Some(chat) = &self.chat {
                    if let Err(e) = chat.join(&username).await {
                        tracing::warn!(channel = %username, error = %e, "Join chat failed");
                    }
                }
            }
        }
    }

    async fn submit_or_defer(&self, topic: Topic) {
        let Err(e) = self.pool.submit(topic.clone()).await else {
            return;
        };
        if !e.is_recoverable_by_reconnect() || self.pool.is_ended() {
            tracing::error!(topic = %topic, cause = e.cause(), error = %e, "Subscribe failed");
            return;
        }
        tracing::warn!(topic = %topic, cause = e.cause(), error = %e, "Subscribe failed, will retry");
        let mut pending = self.pending.lock().await;
        if !pending.contains(&topic) {
            pending.push(topic);
        }
    }

    /// Topics still waiting for a connection.
    pub async fn pending_topics(&self) -> Vec<Topic> {
        self.pending.lock().await.clone()
    }

    /// Submit every pending topic again. Returns how many are still pending.
    pub async fn retry_pending(&self) -> usize {
        let topics = std::mem::take(&mut *self.pending.lock().await);
        if topics.is_empty() {
            return 0;
        }
        let count = topics.len();
        for topic in topics {
            self.submit_or_defer(topic).await;
        }
        let left = self.pending.lock().await.len();
        tracing::info!(retried = count, pending = left, "Retried pending subscriptions");
        left
    }

    async fn refresh(&self) {
        match self.reload_streamers().await {
            Ok(added) => self.subscribe(&added).await,
            Err(e) => tracing::error!(cause = e.cause(), error = %e, "Streamer refresh failed"),
        }
    }

    fn next_sweep(&self) -> Duration {
        let (lo, hi) = self.options.sweep_interval;
        let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64().max(lo.as_secs_f64()));
        Duration::from_secs_f64(secs)
    }

    /// Start everything and run until cancelled. Returns the final report.
    pub async fn run(self: Arc<Self>) -> Result<SessionReport> {
        tracing::info!(session = %self.session.id, login = %self.api.login(), "Starting session");

        if self.options.claim_drops_startup {
            match self.api.claim_available_rewards().await {
                Ok(claimed) => tracing::info!(claimed, "Claimed drops from inventory"),
                Err(e) => tracing::warn!(error = %e, "Claiming drops failed"),
            }
        }

        let added = self.reload_streamers().await?;
        self.subscribe(&added).await;

        let watcher = MinuteWatcher::new(
            self.store.clone(),
            self.api.clone(),
            self.options.priority.clone(),
        )
        .with_interval(self.options.heartbeat_interval);
        self.workers.spawn(watcher.run(self.cancel.child_token()));

        let mut claim_drops = false;
        for handle in self.store.streamers() {
            claim_drops |= handle.lock().await.settings.claim_drops;
        }
        if claim_drops {
            let sync = DropsSync::new(self.store.clone(), self.api.clone())
                .with_interval(self.options.drops_interval);
            self.workers.spawn(sync.run(self.cancel.child_token()));
        }

        let mut last_refresh = Instant::now();
        loop {
            let wait = self.next_sweep();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.retry_pending().await;
            let report = liveness::sweep(&self.pool, self.probe.as_ref(), self.options.stale_after).await;
            tracing::debug!(
                connections = report.checked,
                stale = report.stale,
                reconnected = report.reconnected,
                failed = report.failed,
                "Liveness sweep"
            );

            if let Some(every) = self.options.refresh {
                if last_refresh.elapsed() >= every {
                    last_refresh = Instant::now();
                    self.refresh().await;
                }
            }
        }

        Ok(self.shutdown().await)
    }

    /// Stop every worker and build the final report. Safe to call twice.
    pub async fn shutdown(&self) -> SessionReport {
        let wait = self.options.shutdown_wait;
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::info!("Shutting down, please wait");
            self.cancel.cancel();

            if let Some(chat) = &self.chat {
                for username in self.store.usernames() {
                    if let Err(e) = chat.leave(&username).await {
                        tracing::debug!(channel = %username, error = %e, "Leave chat failed");
                    }
                }
            }

            self.pool.end().await;
            let aborted = self.workers.shutdown(wait).await;
            if aborted > 0 {
                tracing::warn!(aborted, "Some workers had to be aborted");
            }
        }

        let (streamers, unavailable) = self.store.snapshot_within(wait).await;
        let events = self.store.prediction_snapshot(wait).await;
        let base: HashMap<String, u64> = self
            .base_points
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let report = SessionReport::build(&self.session, &streamers, &events, &base, unavailable);
        report.log();
        report
    }
}
