//! Topic-to-connection multiplexer.
//!
//! Topics are packed onto connections up to the upstream limit. Each
//! connection runs a receive loop and a ping loop on its current link; a
//! stale or broken connection is reconnected in place and every topic it held
//! is subscribed again on the new link.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{MinerError, Result};
use crate::topic::Topic;
use crate::transport::{Connector, FrameSink, FrameSource, Link};

/// Upstream limit of topics per connection.
pub const MAX_TOPICS_PER_CONNECTION: usize = 50;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_topics: usize,
    /// A PING is sent at a random point in this range.
    pub ping_interval: (Duration, Duration),
    /// Wait before reconnecting after the link dropped or the server asked.
    pub reconnect_delay: Duration,
    /// LISTEN send attempts per topic during reconnection.
    pub subscribe_attempts: u32,
    /// Bound on every wait while closing a link.
    pub close_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_topics: MAX_TOPICS_PER_CONNECTION,
            ping_interval: (Duration::from_secs(25), Duration::from_secs(30)),
            reconnect_delay: Duration::from_secs(30),
            subscribe_attempts: 3,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// What the frame handler wants the connection to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// The server asked us to reconnect.
    Reconnect,
}

/// Consumer of inbound frames.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, connection: usize, raw: &str) -> Control;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Reconnecting = 1,
    Failed = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Open,
            1 => ConnectionState::Reconnecting,
            2 => ConnectionState::Failed,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// An equal topic was already bound; nothing was sent.
    AlreadyBound,
    /// Bound to an existing connection.
    Bound { connection: usize },
    /// No connection had room; a new one was opened.
    Opened { connection: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Another reconnect already owns this connection.
    AlreadyInProgress,
    Reconnected {
        rebound: usize,
        /// Topics given up on for this session.
        abandoned: Vec<Topic>,
    },
}

/// Where a new topic goes. Every open connection being full is not an error.
enum Binding {
    Existing(Arc<Connection>),
    NeedsConnection,
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

struct LinkHandle {
    sink: SharedSink,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// One physical link and the topics bound to it.
pub struct Connection {
    id: usize,
    state: AtomicU8,
    topics: Mutex<Vec<Topic>>,
    link: Mutex<Option<LinkHandle>>,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl Connection {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Open as u8),
            topics: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state() == ConnectionState::Reconnecting
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.topics.lock().await.clone()
    }

    pub async fn has_topic(&self, topic: &Topic) -> bool {
        self.topics.lock().await.contains(topic)
    }

    /// Time since the last inbound frame (or since the link opened).
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Acquire)))
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Release);
    }

    /// OPEN|FAILED -> RECONNECTING. Only one caller can win.
    fn begin_reconnect(&self) -> bool {
        [ConnectionState::Open, ConnectionState::Failed]
            .iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        *from as u8,
                        ConnectionState::Reconnecting as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            })
    }

    fn finish_reconnect(&self, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Reconnecting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    async fn send(&self, frame: String) -> Result<()> {
        let sink = match self.link.lock().await.as_ref() {
            Some(link) => link.sink.clone(),
            None => return Err(MinerError::Transport(format!("#{} has no open link", self.id))),
        };
        let mut sink = sink.lock().await;
        sink.send(frame).await
    }

    async fn listen(&self, topic: &Topic, auth_token: &str) -> Result<()> {
        let mut data = json!({ "topics": [topic.wire_name()] });
        if topic.kind.is_user_scoped() {
            data["auth_token"] = json!(auth_token);
        }
        let frame = json!({ "type": "LISTEN", "nonce": nonce(), "data": data });
        self.send(frame.to_string()).await
    }

    async fn listen_with_retry(&self, topic: &Topic, auth_token: &str, attempts: u32) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match self.listen(topic, auth_token).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(connection = self.id, topic = %topic, attempt, error = %e, "LISTEN failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MinerError::Transport("no attempt made".into())))
    }

    /// Cancel the current link and wait (bounded) for its tasks.
    async fn close_link(&self, wait: Duration) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        link.cancel.cancel();
        match tokio::time::timeout(wait, async {
            let mut sink = link.sink.lock().await;
            sink.close().await;
        })
        .await
        {
            Ok(()) => {}
            Err(_) => tracing::warn!(connection = self.id, "Link close timed out, dropping it"),
        }
        for mut task in link.tasks {
            if tokio::time::timeout(wait, &mut task).await.is_err() {
                tracing::warn!(connection = self.id, "Link task unresponsive, aborting");
                task.abort();
            }
        }
    }
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect()
}

/// All connections, plus the machinery to open and replace them.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    handler: Arc<dyn FrameHandler>,
    auth_token: String,
    settings: PoolSettings,
    connections: Mutex<Vec<Arc<Connection>>>,
    next_id: AtomicUsize,
    cancel: CancellationToken,
    background: TaskTracker,
    ended: AtomicBool,
    me: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        handler: Arc<dyn FrameHandler>,
        auth_token: &str,
        settings: PoolSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            connector,
            handler,
            auth_token: auth_token.to_string(),
            settings,
            connections: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            cancel,
            background: TaskTracker::new(),
            ended: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Snapshot of the current connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn topic_count(&self) -> usize {
        let connections = self.connections().await;
        let mut total = 0;
        for connection in connections {
            total += connection.topics.lock().await.len();
        }
        total
    }

    /// Bind a topic, opening a new connection if every open one is full.
    pub async fn submit(&self, topic: Topic) -> Result<SubmitOutcome> {
        if self.ended.load(Ordering::Acquire) {
            return Err(MinerError::Transport("pool has ended".into()));
        }
        let mut connections = self.connections.lock().await;

        for connection in connections.iter() {
            if connection.has_topic(&topic).await {
                tracing::debug!(topic = %topic, connection = connection.id, "Topic already bound");
                return Ok(SubmitOutcome::AlreadyBound);
            }
        }

        let mut binding = Binding::NeedsConnection;
        for connection in connections.iter() {
            if connection.state() == ConnectionState::Open
                && connection.topics.lock().await.len() < self.settings.max_topics
            {
                binding = Binding::Existing(connection.clone());
                break;
            }
        }

        let (connection, opened) = match binding {
            Binding::Existing(connection) => (connection, false),
            Binding::NeedsConnection => {
                let connection = self.open_connection().await?;
                connections.push(connection.clone());
                (connection, true)
            }
        };

        if let Err(e) = connection
            .listen_with_retry(&topic, &self.auth_token, self.settings.subscribe_attempts)
            .await
        {
            tracing::warn!(
                connection = connection.id,
                topic = %topic,
                error = %e,
                "LISTEN failed, topic will be resent on reconnect"
            );
            self.schedule_reconnect(connection.clone());
        }
        connection.topics.lock().await.push(topic.clone());
        tracing::debug!(connection = connection.id, topic = %topic, "Subscribed");

        Ok(if opened {
            SubmitOutcome::Opened {
                connection: connection.id,
            }
        } else {
            SubmitOutcome::Bound {
                connection: connection.id,
            }
        })
    }

    async fn open_connection(&self) -> Result<Arc<Connection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id));
        let link = self.connector.connect().await?;
        self.install_link(&connection, link).await;
        tracing::info!(connection = id, "Opened pubsub connection");
        Ok(connection)
    }

    async fn install_link(&self, connection: &Arc<Connection>, link: Link) {
        let Link { sink, source } = link;
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let cancel = self.cancel.child_token();
        connection.touch();

        let receive = tokio::spawn(receive_loop(
            self.me.clone(),
            connection.clone(),
            source,
            self.handler.clone(),
            cancel.clone(),
        ));
        let ping = tokio::spawn(ping_loop(
            connection.id,
            sink.clone(),
            self.settings.ping_interval,
            cancel.clone(),
        ));

        *connection.link.lock().await = Some(LinkHandle {
            sink,
            cancel,
            tasks: vec![receive, ping],
        });
    }

    /// Reconnect after `reconnect_delay` unless the pool is shutting down.
    fn schedule_reconnect(&self, connection: Arc<Connection>) {
        if self.ended.load(Ordering::Acquire) {
            return;
        }
        let pool = self.me.clone();
        let cancel = self.cancel.clone();
        let delay = self.settings.reconnect_delay;
        self.background.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(pool) = pool.upgrade() else { return };
            if let Err(e) = pool.reconnect(&connection).await {
                tracing::error!(connection = connection.id, cause = e.cause(), error = %e, "Reconnect failed");
            }
        });
    }

    /// Replace the link under `connection` and subscribe its topics again.
    pub async fn reconnect(&self, connection: &Arc<Connection>) -> Result<ReconnectOutcome> {
        if self.ended.load(Ordering::Acquire) {
            return Err(MinerError::Transport("pool has ended".into()));
        }
        let topics = {
            let _connections = self.connections.lock().await;
            if !connection.begin_reconnect() {
                return Ok(ReconnectOutcome::AlreadyInProgress);
            }
            connection.topics.lock().await.clone()
        };

        tracing::info!(connection = connection.id, topics = topics.len(), "Reconnecting");
        connection.close_link(self.settings.close_timeout).await;

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                connection.finish_reconnect(ConnectionState::Failed);
                tracing::warn!(connection = connection.id, error = %e, "Could not reopen link");
                return Err(e);
            }
        };
        self.install_link(connection, link).await;

        let mut rebound = Vec::with_capacity(topics.len());
        let mut abandoned = Vec::new();
        for topic in topics {
            match connection
                .listen_with_retry(&topic, &self.auth_token, self.settings.subscribe_attempts)
                .await
            {
                Ok(()) => rebound.push(topic),
                Err(e) => {
                    tracing::error!(
                        connection = connection.id,
                        topic = %topic,
                        error = %e,
                        "Giving up on topic for this session"
                    );
                    abandoned.push(topic);
                }
            }
        }

        {
            let _connections = self.connections.lock().await;
            *connection.topics.lock().await = rebound.clone();
        }

        if self.ended.load(Ordering::Acquire) || !connection.finish_reconnect(ConnectionState::Open) {
            connection.close_link(self.settings.close_timeout).await;
            return Err(MinerError::Transport("pool ended during reconnect".into()));
        }

        tracing::info!(
            connection = connection.id,
            rebound = rebound.len(),
            abandoned = abandoned.len(),
            "Reconnected"
        );
        Ok(ReconnectOutcome::Reconnected {
            rebound: rebound.len(),
            abandoned,
        })
    }

    /// Close every connection. Safe to call more than once.
    pub async fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let connections = self.connections().await;
        for connection in &connections {
            connection
                .state
                .store(ConnectionState::Closed as u8, Ordering::Release);
            connection.close_link(self.settings.close_timeout).await;
        }
        self.background.close();
        if tokio::time::timeout(self.settings.close_timeout, self.background.wait())
            .await
            .is_err()
        {
            tracing::warn!("Pending reconnects did not finish in time");
        }
        tracing::info!(connections = connections.len(), "Connection pool closed");
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

async fn receive_loop(
    pool: Weak<ConnectionPool>,
    connection: Arc<Connection>,
    mut source: Box<dyn FrameSource>,
    handler: Arc<dyn FrameHandler>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = source.next_frame() => frame,
        };
        match frame {
            Some(Ok(raw)) => {
                connection.touch();
                if handler.on_frame(connection.id, &raw).await == Control::Reconnect {
                    break "server requested reconnect";
                }
            }
            Some(Err(e)) => {
                tracing::warn!(connection = connection.id, cause = e.cause(), error = %e, "Receive failed");
                break "receive error";
            }
            None => break "closed by peer",
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    tracing::info!(connection = connection.id, reason, "Link lost, scheduling reconnect");
    if let Some(pool) = pool.upgrade() {
        pool.schedule_reconnect(connection);
    }
}

async fn ping_loop(
    connection: usize,
    sink: SharedSink,
    interval: (Duration, Duration),
    cancel: CancellationToken,
) {
    loop {
        let wait = {
            let (lo, hi) = (interval.0.as_millis() as u64, interval.1.as_millis() as u64);
            Duration::from_millis(rand::thread_rng().gen_range(lo..=hi.max(lo)))
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let result = sink.lock().await.send(json!({ "type": "PING" }).to_string()).await;
        if let Err(e) = result {
            tracing::debug!(connection, error = %e, "PING failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ConnectionState::Open,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_begin_reconnect_is_exclusive() {
        let connection = Connection::new(0);
        assert!(connection.begin_reconnect());
        assert!(!connection.begin_reconnect());
        assert!(connection.finish_reconnect(ConnectionState::Failed));
        assert!(connection.begin_reconnect(), "a failed connection can be retried");
        assert!(connection.finish_reconnect(ConnectionState::Open));
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_closed_connection_never_reconnects() {
        let connection = Connection::new(0);
        connection
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        assert!(!connection.begin_reconnect());
    }

    #[test]
    fn test_nonce_shape() {
        let n = nonce();
        assert_eq!(n.len(), 30);
        assert!(n.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
