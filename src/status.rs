//! Read-only HTTP status endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;
use crate::prediction::PredictionEvent;
use crate::report::Session;
use crate::store::EntityStore;

#[derive(Clone)]
pub struct StatusState {
    pub session: Session,
    pub store: Arc<EntityStore>,
    pub pool: Option<Arc<ConnectionPool>>,
}

#[derive(Debug, Serialize)]
pub struct StreamerStatus {
    pub username: String,
    pub channel_id: String,
    pub channel_points: u64,
    pub is_online: bool,
    pub minute_watched: u32,
    pub viewer_is_mod: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub connections: usize,
    pub topics: usize,
    pub streamers: Vec<StreamerStatus>,
    pub predictions: Vec<PredictionEvent>,
}

pub fn build_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<StatusSnapshot> {
    let wait = Duration::from_millis(500);
    let (streamers, _) = state.store.snapshot_within(wait).await;
    let (connections, topics) = match &state.pool {
        Some(pool) => (pool.connection_count().await, pool.topic_count().await),
        None => (0, 0),
    };
    Json(StatusSnapshot {
        session_id: state.session.id.clone(),
        started_at: state.session.started_at,
        connections,
        topics,
        streamers: streamers
            .into_iter()
            .map(|s| StreamerStatus {
                username: s.username,
                channel_id: s.channel_id,
                channel_points: s.channel_points,
                is_online: s.is_online,
                minute_watched: s.stream.minute_watched,
                viewer_is_mod: s.viewer_is_mod,
            })
            .collect(),
        predictions: state.store.prediction_snapshot(wait).await,
    })
}

/// Serve until `cancel` fires.
pub async fn serve(port: u16, state: Arc<StatusState>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Status endpoint listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::Streamer;

    #[tokio::test]
    async fn test_status_and_health() {
        let store = Arc::new(EntityStore::new());
        let mut s = Streamer::new("alice");
        s.channel_id = "1".into();
        s.channel_points = 77;
        store.insert(s);
        let state = Arc::new(StatusState {
            session: Session::start(),
            store,
            pool: None,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, build_router(state)).await });

        let client = reqwest::Client::new();
        let health = client.get(format!("http://{}/health", addr)).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let status: serde_json::Value = client
            .get(format!("http://{}/status", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["streamers"][0]["username"], "alice");
        assert_eq!(status["streamers"][0]["channel_points"], 77);
        assert_eq!(status["connections"], 0);
    }
}
