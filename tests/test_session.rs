//! End-to-end session tests: load streamers, feed frames, shut down, read the report.

mod fixtures;

use fixtures::*;
use pointsminer::miner::{Miner, MinerOptions, Sources};
use pointsminer::pool::PoolSettings;
use pointsminer::prediction::{BetResult, EventStatus};
use pointsminer::report::SessionReport;
use pointsminer::settings::{DelayMode, Stake, StreamerSettings, Strategy};
use pointsminer::tracking::{TrackedStreamer, TrackingFile};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn options() -> MinerOptions {
    let mut defaults = StreamerSettings::default();
    defaults.bet.strategy = Strategy::MostVoted;
    defaults.bet.stake = Stake::Fixed(10);
    defaults.bet.delay_mode = DelayMode::FromStart;
    defaults.bet.delay = 0.0;
    MinerOptions {
        defaults,
        sweep_interval: (Duration::from_millis(20), Duration::from_millis(40)),
        shutdown_wait: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(3600),
        pool: PoolSettings {
            close_timeout: Duration::from_millis(200),
            ..PoolSettings::default()
        },
        ..MinerOptions::default()
    }
}

fn api() -> Arc<MockApi> {
    Arc::new(
        MockApi::new("viewer", "99")
            .with_channel("a", "1", 100, true)
            .with_channel("b", "2", 50, false),
    )
}

fn start(api: Arc<MockApi>, connector: Arc<MockConnector>, sources: Sources) -> (Arc<Miner>, JoinHandle<SessionReport>) {
    let miner = Miner::new(api, connector, MockProbe::new(true), None, sources, options());
    let running = miner.clone();
    let task = tokio::spawn(async move { running.run().await.unwrap() });
    (miner, task)
}

fn listed(names: &[&str]) -> Sources {
    Sources {
        streamers: names.iter().map(|n| n.to_string()).collect(),
        ..Sources::default()
    }
}

async fn subscribed(connector: &MockConnector, topic: &str) -> bool {
    let topic = topic.to_string();
    wait_for(Duration::from_secs(2), || {
        let found = connector.listens().contains(&topic);
        async move { found }
    })
    .await
}

#[tokio::test]
async fn test_point_update_shows_in_report() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api.clone(), connector.clone(), listed(&["a", "b"]));
    assert!(subscribed(&connector, "video-playback-by-id.2").await);

    connector.push(0, points_earned("99", "1", 50, "WATCH", 150));
    let store = miner.store().clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let store = store.clone();
            async move { store.with_streamer("1", |s| s.channel_points).await == Some(150) }
        })
        .await
    );

    miner.cancel_token().cancel();
    let report = task.await.unwrap();
    assert_eq!(report.gained("a"), Some(50));
    assert_eq!(report.gained("b"), None);
    assert!(report.unavailable.is_empty());
}

#[tokio::test]
async fn test_subscribes_user_and_channel_topics() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api, connector.clone(), listed(&["a", "b", "ghost"]));
    assert!(subscribed(&connector, "predictions-channel-v1.2").await);

    let listens = connector.listens();
    for topic in [
        "community-points-user-v1.99",
        "predictions-user-v1.99",
        "video-playback-by-id.1",
        "raid.1",
        "predictions-channel-v1.1",
        "video-playback-by-id.2",
    ] {
        assert!(listens.contains(&topic.to_string()), "missing {}", topic);
    }
    assert_eq!(miner.store().usernames(), vec!["a", "b"], "unknown logins are skipped");

    miner.cancel_token().cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_prediction_lifecycle() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api.clone(), connector.clone(), listed(&["a", "b"]));
    assert!(subscribed(&connector, "predictions-channel-v1.1").await);

    connector.push(0, points_earned("99", "1", 50, "WATCH", 150));
    let outcomes = [("o0", 100, 5), ("o1", 100, 3)];
    connector.push(0, event_frame("event-created", "1", "e1", "ACTIVE", &outcomes, None));
    assert!(
        wait_for(Duration::from_secs(2), || {
            let n = api.predictions().len();
            async move { n == 1 }
        })
        .await
    );
    assert_eq!(api.predictions()[0], ("e1".to_string(), "o0".to_string(), 10));

    connector.push(0, event_frame("event-updated", "1", "e1", "LOCKED", &outcomes, None));
    connector.push(0, event_frame("event-updated", "1", "e1", "RESOLVED", &outcomes, Some("o0")));

    let store = miner.store().clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let store = store.clone();
            async move {
                match store.prediction("e1") {
                    Some(event) => event.lock().await.status == EventStatus::Resolved,
                    None => false,
                }
            }
        })
        .await
    );
    {
        let event = store.prediction("e1").unwrap();
        let event = event.lock().await;
        assert_eq!(event.result, BetResult::Win);
        assert_eq!(event.points_won, 20);
    }
    assert_eq!(store.with_streamer("1", |s| s.channel_points).await, Some(170));

    miner.cancel_token().cancel();
    let report = task.await.unwrap();
    assert_eq!(report.gained("a"), Some(70));
    assert_eq!(report.predictions.len(), 1);
    assert!(report.predictions[0].recap.contains("Win"));
}

#[tokio::test]
async fn test_shutdown_releases_stalled_guard() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api, connector.clone(), listed(&["a", "b"]));
    assert!(subscribed(&connector, "video-playback-by-id.2").await);

    let handle = miner.store().get("1").unwrap();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    miner.workers().spawn(async move {
        let _guard = handle.lock().await;
        held_tx.send(()).ok();
        std::future::pending::<()>().await;
    });
    held_rx.await.unwrap();

    miner.cancel_token().cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("shutdown must not deadlock")
        .unwrap();

    assert!(report.unavailable.is_empty(), "aborting the worker frees the guard");
    assert!(miner.store().get("1").unwrap().try_lock().is_ok());
}

#[tokio::test]
async fn test_shutdown_reports_guard_held_outside_workers() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api, connector.clone(), listed(&["a", "b"]));
    assert!(subscribed(&connector, "video-playback-by-id.2").await);

    let handle = miner.store().get("1").unwrap();
    let guard = handle.lock().await;

    miner.cancel_token().cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("shutdown must not deadlock")
        .unwrap();
    drop(guard);

    assert_eq!(report.unavailable, vec!["a"]);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let api = api();
    let connector = MockConnector::new();
    let (miner, task) = start(api, connector.clone(), listed(&["a"]));
    assert!(subscribed(&connector, "video-playback-by-id.1").await);

    miner.cancel_token().cancel();
    task.await.unwrap();
    let again = miner.shutdown().await;
    assert!(miner.pool().is_ended());
    assert!(again.unavailable.is_empty());
}

#[tokio::test]
async fn test_reload_follows_tracking_file_and_followers() {
    let dir = std::env::temp_dir().join(format!("pointsminer-session-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let file = TrackingFile::new(dir.join("streamers.json"));
    file.save(&[
        TrackedStreamer {
            username: "a".into(),
            settings: Default::default(),
        },
        TrackedStreamer {
            username: "b".into(),
            settings: Default::default(),
        },
    ])
    .await
    .unwrap();

    let api = Arc::new(
        MockApi::new("viewer", "99")
            .with_channel("a", "1", 100, true)
            .with_channel("b", "2", 50, false)
            .with_channel("c", "3", 10, true),
    );
    api.set_followers(&["c"]);
    let sources = Sources {
        tracking_file: Some(file.clone()),
        followers: true,
        blacklist: vec!["b".into()],
        ..Sources::default()
    };
    let miner = Miner::new(api.clone(), MockConnector::new(), MockProbe::new(true), None, sources, options());

    let added = miner.reload_streamers().await.unwrap();
    assert_eq!(added, vec!["1", "3"]);
    assert_eq!(miner.store().usernames(), vec!["a", "c"]);

    api.set_followers(&[]);
    let added = miner.reload_streamers().await.unwrap();
    assert!(added.is_empty());
    assert_eq!(miner.store().usernames(), vec!["a"]);

    let saved: Vec<String> = file.load().await.unwrap().into_iter().map(|t| t.username).collect();
    assert_eq!(saved, vec!["a"]);
    miner.shutdown().await;
    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn test_refused_connect_is_retried_by_sweep() {
    let api = api();
    let connector = MockConnector::new();
    connector.fail_next_connects(1);
    let (miner, task) = start(api, connector.clone(), listed(&["a", "b"]));

    assert!(subscribed(&connector, "video-playback-by-id.2").await);
    assert!(
        subscribed(&connector, "community-points-user-v1.99").await,
        "refused topic is bound on a later sweep"
    );
    assert!(
        wait_for(Duration::from_secs(2), || {
            let miner = miner.clone();
            async move { miner.pending_topics().await.is_empty() }
        })
        .await
    );
    assert!(!task.is_finished(), "one refused connect must not end the session");

    miner.cancel_token().cancel();
    let report = task.await.unwrap();
    assert!(report.unavailable.is_empty());
}
