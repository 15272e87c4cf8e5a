//! Sync triggers: periodic timer, foreground events and manual requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fitsync_common::{Error, Result};

use crate::engine::{SyncCoordinator, SyncMode, SyncOutcome};

/// Events that may start a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The app became active: sync once and start the periodic timer.
    Foreground,
    /// The app went to the background: stop the periodic timer.
    Background,
    /// Explicit request for a pass of the given kind.
    Manual(SyncMode),
    /// Stop the trigger loop.
    Shutdown,
}

type Request = (Trigger, Option<oneshot::Sender<SyncOutcome>>);

/// Sending side of the trigger channel.
#[derive(Clone)]
pub struct SyncTriggers {
    request_tx: mpsc::Sender<Request>,
}

/// Receiving side; drives the coordinator from a spawned task.
pub struct TriggerLoop {
    request_rx: mpsc::Receiver<Request>,
    periodic_interval: Duration,
    active: bool,
}

/// Create a connected trigger pair.
///
/// With `start_active`, the periodic timer runs from the start as if a
/// `Foreground` trigger had been received.
pub fn channel(periodic_interval: Duration, start_active: bool) -> (SyncTriggers, TriggerLoop) {
    let (request_tx, request_rx) = mpsc::channel(32);
    (
        SyncTriggers { request_tx },
        TriggerLoop {
            request_rx,
            periodic_interval: periodic_interval.max(Duration::from_millis(1)),
            active: start_active,
        },
    )
}

impl SyncTriggers {
    async fn send(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Cancelled("Trigger loop not running".to_string()))
    }

    /// Report that the app became active.
    pub async fn foreground(&self) -> Result<()> {
        self.send((Trigger::Foreground, None)).await
    }

    /// Report that the app went to the background.
    pub async fn background(&self) -> Result<()> {
        self.send((Trigger::Background, None)).await
    }

    /// Request a pass and wait for its outcome.
    pub async fn request(&self, mode: SyncMode) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send((Trigger::Manual(mode), Some(response_tx))).await?;
        response_rx
            .await
            .map_err(|_| Error::Cancelled("Trigger loop stopped before replying".to_string()))
    }

    /// Stop the loop after the pass in progress, if any.
    pub async fn shutdown(&self) {
        let _ = self.send((Trigger::Shutdown, None)).await;
    }
}

impl TriggerLoop {
    /// Run until shutdown or until every [`SyncTriggers`] is dropped.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self, coordinator: Arc<SyncCoordinator>) {
        let period = self.periodic_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Sync triggers started (periodic every {:?})", period);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((trigger, reply)) = request else {
                        debug!("All trigger senders dropped");
                        break;
                    };
                    let mode = match trigger {
                        Trigger::Shutdown => {
                            info!("Received shutdown trigger");
                            break;
                        }
                        Trigger::Background => {
                            debug!("Periodic sync paused");
                            self.active = false;
                            None
                        }
                        Trigger::Foreground => {
                            self.active = true;
                            ticker.reset();
                            Some(SyncMode::Incremental)
                        }
                        Trigger::Manual(mode) => Some(mode),
                    };

                    if let Some(mode) = mode {
                        debug!("Processing trigger {:?}", trigger);
                        let outcome = coordinator.sync_with(mode, &CancellationToken::new()).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                }

                _ = ticker.tick(), if self.active => {
                    debug!("Triggering periodic sync");
                    coordinator.sync_incremental().await;
                }
            }
        }

        info!("Sync triggers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncConfig;
    use crate::state::{AccountCause, SyncFailure};
    use fitsync_common::AccountStatus;
    use fitsync_storage::{MemoryLocalStore, MemoryQueueStore, MemoryRemoteStore, MemoryTokenStore};

    async fn coordinator(remote: Arc<MemoryRemoteStore>) -> Arc<SyncCoordinator> {
        Arc::new(
            SyncCoordinator::open(
                SyncConfig::default(),
                remote,
                Arc::new(MemoryLocalStore::new()),
                Arc::new(MemoryQueueStore::new()),
                Arc::new(MemoryTokenStore::new()),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_manual_request_returns_outcome() {
        let coordinator = coordinator(Arc::new(MemoryRemoteStore::new())).await;
        let (triggers, trigger_loop) = channel(Duration::from_secs(3600), false);
        let task = tokio::spawn(trigger_loop.run(coordinator));

        let outcome = triggers.request(SyncMode::Full).await.unwrap();
        assert!(outcome.is_completed());

        triggers.shutdown().await;
        task.await.unwrap();
        assert!(triggers.request(SyncMode::Full).await.is_err());
    }

    #[tokio::test]
    async fn test_account_failure_surfaces_through_trigger() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_account_status(AccountStatus::Restricted);
        let coordinator = coordinator(remote).await;
        let (triggers, trigger_loop) = channel(Duration::from_secs(3600), false);
        tokio::spawn(trigger_loop.run(coordinator));

        let outcome = triggers.request(SyncMode::Incremental).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Failed(SyncFailure::Account(AccountCause::Restricted))
        );
    }

    #[tokio::test]
    async fn test_periodic_timer_runs_while_active() {
        let coordinator = coordinator(Arc::new(MemoryRemoteStore::new())).await;
        let (triggers, trigger_loop) = channel(Duration::from_millis(10), true);
        tokio::spawn(trigger_loop.run(coordinator.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.status().last_sync_at.is_some());

        triggers.shutdown().await;
    }

    #[tokio::test]
    async fn test_foreground_syncs_once() {
        let coordinator = coordinator(Arc::new(MemoryRemoteStore::new())).await;
        let (triggers, trigger_loop) = channel(Duration::from_secs(3600), false);
        tokio::spawn(trigger_loop.run(coordinator.clone()));

        triggers.foreground().await.unwrap();
        // The manual request is handled after the foreground pass.
        triggers.request(SyncMode::Incremental).await.unwrap();
        assert!(coordinator.status().last_sync_at.is_some());
    }
}
