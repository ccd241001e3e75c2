//! Concurrency-safe registry of streamers and prediction events.
//!
//! Every entry lives behind its own `tokio::sync::Mutex`. Map references are
//! never held across an await: handles are cloned out first, then locked.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::prediction::PredictionEvent;
use crate::streamer::Streamer;

pub type StreamerHandle = Arc<Mutex<Streamer>>;
pub type PredictionHandle = Arc<Mutex<PredictionEvent>>;

struct Tracked {
    /// Declaration order.
    seq: u64,
    username: String,
    handle: StreamerHandle,
}

/// Streamers by channel id and prediction events by event id.
#[derive(Default)]
pub struct EntityStore {
    streamers: DashMap<String, Tracked>,
    logins: DashMap<String, String>,
    predictions: DashMap<String, PredictionHandle>,
    next_seq: AtomicU64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a streamer (keyed by its channel id). An existing entry wins.
    pub fn insert(&self, streamer: Streamer) -> StreamerHandle {
        let channel_id = streamer.channel_id.clone();
        let username = streamer.username.clone();
        let handle = match self.streamers.entry(channel_id.clone()) {
            Entry::Occupied(existing) => existing.get().handle.clone(),
            Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(streamer));
                slot.insert(Tracked {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    username: username.clone(),
                    handle: handle.clone(),
                });
                handle
            }
        };
        self.logins.insert(username, channel_id);
        handle
    }

    pub fn get(&self, channel_id: &str) -> Option<StreamerHandle> {
        self.streamers.get(channel_id).map(|t| t.handle.clone())
    }

    pub fn get_by_login(&self, username: &str) -> Option<StreamerHandle> {
        let channel_id = self.logins.get(username)?.value().clone();
        self.get(&channel_id)
    }

    pub fn contains_login(&self, username: &str) -> bool {
        self.logins.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamers.is_empty()
    }

    /// All streamer handles in declaration order.
    pub fn streamers(&self) -> Vec<StreamerHandle> {
        let mut entries: Vec<(u64, StreamerHandle)> = self
            .streamers
            .iter()
            .map(|t| (t.seq, t.handle.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, h)| h).collect()
    }

    /// Usernames in declaration order.
    pub fn usernames(&self) -> Vec<String> {
        let mut entries: Vec<(u64, String)> = self
            .streamers
            .iter()
            .map(|t| (t.seq, t.username.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, u)| u).collect()
    }

    /// Re-number declaration order to follow `usernames`. Unlisted streamers go last.
    pub fn set_order(&self, usernames: &[String]) {
        let offset = usernames.len() as u64;
        for mut tracked in self.streamers.iter_mut() {
            let position = usernames.iter().position(|u| *u == tracked.username);
            tracked.seq = match position {
                Some(i) => i as u64,
                None => offset + tracked.seq,
            };
        }
        self.next_seq
            .fetch_max(offset + self.next_seq.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Drop a streamer from the active set once no update is in flight on it.
    pub async fn remove(&self, channel_id: &str) -> Option<Streamer> {
        let handle = self.get(channel_id)?;
        let guard = handle.lock().await;
        let removed = self.streamers.remove(channel_id)?;
        self.logins.remove(&removed.1.username);
        Some(guard.clone())
    }

    /// Run `f` on a streamer under its guard.
    pub async fn with_streamer<R>(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut Streamer) -> R,
    ) -> Option<R> {
        let handle = self.get(channel_id)?;
        let mut guard = handle.lock().await;
        Some(f(&mut guard))
    }

    /// Insert the event if absent. Returns the handle and whether it was created.
    pub fn upsert_prediction(
        &self,
        event_id: &str,
        make: impl FnOnce() -> PredictionEvent,
    ) -> (PredictionHandle, bool) {
        match self.predictions.entry(event_id.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(make()));
                slot.insert(handle.clone());
                (handle, true)
            }
        }
    }

    pub fn prediction(&self, event_id: &str) -> Option<PredictionHandle> {
        self.predictions.get(event_id).map(|p| p.clone())
    }

    pub fn prediction_count(&self) -> usize {
        self.predictions.len()
    }

    pub fn predictions(&self) -> Vec<PredictionHandle> {
        self.predictions.iter().map(|p| p.clone()).collect()
    }

    /// Copies of every event, oldest first. Events whose guard stays held past `wait` are skipped.
    pub async fn prediction_snapshot(&self, wait: Duration) -> Vec<PredictionEvent> {
        let mut out = Vec::new();
        for handle in self.predictions() {
            match tokio::time::timeout(wait, handle.lock()).await {
                Ok(event) => out.push(event.clone()),
                Err(_) => tracing::warn!("Prediction guard still held, leaving it out of the snapshot"),
            }
        }
        out.sort_by_key(|e| e.created_at);
        out
    }

    /// Copy every streamer, waiting at most `wait` for each guard.
    ///
    /// Returns the copies in declaration order and the usernames whose guard
    /// could not be acquired in time.
    pub async fn snapshot_within(&self, wait: Duration) -> (Vec<Streamer>, Vec<String>) {
        let mut entries: Vec<(u64, String, StreamerHandle)> = self
            .streamers
            .iter()
            .map(|t| (t.seq, t.username.clone(), t.handle.clone()))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);

        let mut copies = Vec::with_capacity(entries.len());
        let mut stuck = Vec::new();
        for (_, username, handle) in entries {
            match tokio::time::timeout(wait, handle.lock()).await {
                Ok(guard) => copies.push(guard.clone()),
                Err(_) => {
                    tracing::warn!(channel = %username, "Streamer guard still held after drain timeout");
                    stuck.push(username);
                }
            }
        }
        (copies, stuck)
    }
}
