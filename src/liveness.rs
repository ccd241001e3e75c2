//! Liveness sweep over the connection pool.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::pool::{Connection, ConnectionPool, ConnectionState, ReconnectOutcome};

/// A connection with no inbound frame for this long is reconnected.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Reports whether the network is reachable at all.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Opens a TCP connection to a well-known host.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: &str, timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            timeout,
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new("1.1.1.1:53", Duration::from_secs(3))
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await,
            Ok(Ok(_))
        )
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub stale: usize,
    pub reconnected: usize,
    pub failed: usize,
}

fn is_candidate(connection: &Connection, stale_after: Duration) -> bool {
    matches!(
        connection.state(),
        ConnectionState::Open | ConnectionState::Failed
    ) && connection.idle_for() > stale_after
}

/// Reconnect every stale connection, concurrently, if the network is up.
pub async fn sweep(
    pool: &ConnectionPool,
    probe: &dyn NetworkProbe,
    stale_after: Duration,
) -> SweepReport {
    let connections = pool.connections().await;
    let stale: Vec<Arc<Connection>> = connections
        .iter()
        .filter(|c| is_candidate(c, stale_after))
        .cloned()
        .collect();

    let mut report = SweepReport {
        checked: connections.len(),
        stale: stale.len(),
        ..SweepReport::default()
    };
    if stale.is_empty() {
        return report;
    }
    if !probe.is_reachable().await {
        tracing::warn!(stale = stale.len(), "Network unreachable, postponing reconnects");
        return report;
    }

    let results = join_all(stale.iter().map(|connection| async move {
        tracing::info!(
            connection = connection.id(),
            idle_secs = connection.idle_for().as_secs(),
            "No activity for too long, reconnecting"
        );
        (connection.id(), pool.reconnect(connection).await)
    }))
    .await;

    for (id, result) in results {
        match result {
            Ok(ReconnectOutcome::Reconnected { .. }) => report.reconnected += 1,
            Ok(ReconnectOutcome::AlreadyInProgress) => {
                tracing::debug!(connection = id, "Reconnect already in progress");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(connection = id, cause = e.cause(), error = %e, "Reconnect failed, will retry next sweep");
            }
        }
    }
    report
}
