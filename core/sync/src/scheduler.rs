//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use recordsync_common::{Error, Result};

use crate::engine::SyncReport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when asked.
    Manual,
    /// Full sync at regular intervals, plus requests.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// What a scheduled run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Push, then pull.
    Full,
    /// Pull only.
    Pull,
    /// Push only.
    Push,
    /// Stop the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Front end used to request syncs and change the mode.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a full sync and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Full).await
    }

    /// Send a request and wait for its report.
    ///
    /// # Errors
    /// - `InvalidInput` if the scheduler is not running
    /// - whatever the run itself returned
    pub async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))?
    }

    /// Change the sync mode. Takes effect after the current wait.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Ask the background task to stop.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown or until every [`SyncScheduler`] is dropped.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called for every
    /// request and, in periodic mode, with `SyncRequest::Full` on each tick.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncReport>> + Send,
    {
        let mut current = self.mode.read().await.interval();
        let mut ticker = current.map(Self::ticker);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler fronts dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(sync_fn(request).await);
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Full).await {
                        Ok(report) => info!("Periodic sync completed: {}", report),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current {
                debug!("Sync interval changed to {:?}", expected);
                current = expected;
                ticker = current.map(Self::ticker);
            }
        }

        info!("Sync scheduler stopped");
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_scheduler_creation() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        assert_eq!(scheduler.get_mode().await, SyncMode::Manual);
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);

        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;

        assert!(matches!(
            scheduler.get_mode().await,
            SyncMode::Periodic { .. }
        ));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);

        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();

        let handle_task = tokio::spawn(async move {
            handle
                .run(move |request| {
                    let count = count_clone.clone();
                    async move {
                        assert_eq!(request, SyncRequest::Pull);
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(SyncReport::default())
                    }
                })
                .await;
        });

        let report = scheduler.request(SyncRequest::Pull).await.unwrap();
        assert!(report.push.is_none());
        assert_eq!(sync_count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        handle_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_millis(10),
        });

        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();

        let handle_task = tokio::spawn(handle.run(move |_| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(SyncReport::default())
            }
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;
        handle_task.await.unwrap();

        assert!(sync_count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_request_after_stop() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        drop(handle);

        let result = scheduler.request_sync().await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
