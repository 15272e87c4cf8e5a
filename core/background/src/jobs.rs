//! Work performed by job classes.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fitsync_common::{Error, Result};
use fitsync_sync::{SyncCoordinator, SyncMode, SyncOutcome};

/// Body of a background job.
///
/// Implementations should return promptly once `cancel` fires; the run is
/// abandoned at that point either way.
#[async_trait]
pub trait JobWork: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// Runs a sync pass.
pub struct SyncJob {
    coordinator: Arc<SyncCoordinator>,
    mode: SyncMode,
}

impl SyncJob {
    /// Incremental sync, used by the `sync` class.
    pub fn incremental(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            mode: SyncMode::Incremental,
        }
    }

    /// Full sync, used by the `data-sync` class.
    pub fn full(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            mode: SyncMode::Full,
        }
    }
}

#[async_trait]
impl JobWork for SyncJob {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        match self.coordinator.sync_with(self.mode, &cancel).await {
            SyncOutcome::Completed(_) => Ok(()),
            SyncOutcome::AlreadyRunning => {
                debug!("Skipping background {} sync: a pass is already running", self.mode);
                Ok(())
            }
            SyncOutcome::Failed(failure) => Err(failure.into()),
        }
    }
}

/// Compacts the durable queue.
pub struct MaintenanceJob {
    coordinator: Arc<SyncCoordinator>,
}

impl MaintenanceJob {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl JobWork for MaintenanceJob {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("maintenance window expired".to_string()));
        }
        let queue = self.coordinator.queue();
        queue.compact().await?;
        info!("Maintenance finished ({} operations pending)", queue.len().await);
        Ok(())
    }
}

/// Adapts an async closure into [`JobWork`].
pub struct FnJob<F> {
    f: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobWork for FnJob<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        (self.f)(cancel).await
    }
}
