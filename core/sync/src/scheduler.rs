//! Sync scheduling: manual and periodic modes.
//!
//! Requests are serialized through one channel, so at most one cycle runs
//! at a time even when the periodic timer and a manual request race.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use tasksync_common::{Error, Result};

use crate::status::SyncOutcome;

/// When cycles run on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Only when asked.
    Manual,
    /// Every `interval`, in addition to explicit requests.
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

#[derive(Debug)]
pub enum SyncRequest {
    Sync,
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncOutcome>>;

/// Front end for requesting cycles.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that drives it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));
        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        (scheduler, SyncSchedulerHandle { mode, request_rx })
    }

    /// Request a cycle and wait for its outcome.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Sync, reply_tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)?
    }

    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background task after the current cycle.
    pub async fn shutdown(&self) {
        let (reply_tx, _) = oneshot::channel();
        let _ = self.request_tx.send((SyncRequest::Shutdown, reply_tx)).await;
    }
}

/// Background side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown or until every [`SyncScheduler`] is dropped.
    /// Spawn this on the runtime.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncOutcome>> + Send,
    {
        let mut current = self.mode.read().await.interval();
        let mut ticker = current.map(Self::ticker);
        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some((SyncRequest::Sync, reply)) => {
                        debug!("Processing sync request");
                        let _ = reply.send(sync_fn().await);
                    }
                    Some((SyncRequest::Shutdown, _)) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },
                _ = Self::wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn().await {
                        Ok(outcome) => debug!("Periodic sync finished: {:?}", outcome.status),
                        Err(e) => warn!("Periodic sync failed: {}", e),
                    }
                }
            }

            let wanted = self.mode.read().await.interval();
            if wanted != current {
                current = wanted;
                ticker = current.map(Self::ticker);
            }
        }
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
