//! pointsminer - channel points miner core.
//!
//! This crate keeps a set of streamers and mines their channel points:
//! - Multiplexes pubsub topics over pooled WebSocket connections
//! - Reconnects connections that go quiet, resubscribing every topic
//! - Tracks streamer and prediction state in a concurrency-safe store
//! - Places prediction bets through a configurable strategy
//! - Sends minute-watched heartbeats to the highest-priority streamers
//! - Keeps drop campaign availability in sync for the `DROPS` tier
//!
//! # Architecture
//!
//! The [`Miner`] runs a `tokio::select!` loop over a randomised liveness
//! sweep, an optional source refresh, and a cancellation token. Frames from
//! the pool go through the [`dispatcher::Dispatcher`], which updates the
//! [`EntityStore`] and hands open predictions to the [`PredictionEngine`].

pub mod api;
pub mod bet;
pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod drops;
pub mod error;
pub mod liveness;
pub mod miner;
pub mod pool;
pub mod prediction;
pub mod report;
pub mod settings;
pub mod status;
pub mod store;
pub mod streamer;
pub mod topic;
pub mod tracking;
pub mod transport;
pub mod watcher;
pub mod workers;

pub use api::{GqlClient, TwitchApi};
pub use bet::PredictionEngine;
pub use config::Config;
pub use error::{MinerError, Result};
pub use miner::{Miner, MinerOptions, Sources};
pub use pool::ConnectionPool;
pub use report::SessionReport;
pub use store::EntityStore;
pub use streamer::Streamer;
pub use topic::{Topic, TopicKind};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Config, ConnectionPool, EntityStore, Miner, MinerError, MinerOptions, PredictionEngine,
        SessionReport, Sources, Streamer, Topic, TopicKind, TwitchApi,
    };
    pub use crate::prediction::{EventStatus, PredictionEvent};
    pub use crate::settings::{BetSettings, Priority, StreamerSettings, Strategy};
}
