//! Registry of background workers, joined with a bound at shutdown.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinSet;

pub struct Workers {
    set: Mutex<Option<JoinSet<()>>>,
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Workers {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn a worker. Returns false once the registry has been shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(set) = guard.as_mut() else {
            return false;
        };
        while set.try_join_next().is_some() {}
        set.spawn(task);
        true
    }

    pub fn len(&self) -> usize {
        match self.set.lock() {
            Ok(guard) => guard.as_ref().map_or(0, JoinSet::len),
            Err(poisoned) => poisoned.into_inner().as_ref().map_or(0, JoinSet::len),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `wait` for every worker, then abort the rest.
    ///
    /// Aborted tasks are dropped at their current await point, which releases
    /// any guard they hold. Returns how many had to be aborted.
    pub async fn shutdown(&self, wait: Duration) -> usize {
        let taken = match self.set.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut set) = taken else {
            return 0;
        };

        let drained = tokio::time::timeout(wait, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let stragglers = set.len();
        tracing::warn!(stragglers, "Workers did not stop in time, aborting");
        set.abort_all();
        while set.join_next().await.is_some() {}
        stragglers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn test_shutdown_joins_finished_workers() {
        let workers = Workers::new();
        workers.spawn(async {});
        workers.spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        });
        assert_eq!(workers.shutdown(Duration::from_secs(1)).await, 0);
        assert!(!workers.spawn(async {}), "no spawning after shutdown");
    }

    #[tokio::test]
    async fn test_stalled_worker_is_aborted_and_releases_guard() {
        let workers = Workers::new();
        let guard = Arc::new(AsyncMutex::new(0u32));
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        {
            let guard = guard.clone();
            workers.spawn(async move {
                let _held = guard.lock().await;
                let _ = held_tx.send(());
                std::future::pending::<()>().await;
            });
        }
        held_rx.await.unwrap();
        assert!(guard.try_lock().is_err());

        assert_eq!(workers.shutdown(Duration::from_millis(20)).await, 1);
        assert!(guard.try_lock().is_ok());
    }
}
