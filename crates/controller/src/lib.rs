//! Recon controller: enqueue path, cache sync gate and the reconcile worker pool.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use recon_core::{ChangeObserver, EventRecorder};
use recon_queue::WorkQueue;
use recon_store::ObjectCache;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod enqueue;
mod events;
mod reconciler;
mod sync;
mod worker;

pub use config::ControllerConfig;
pub use enqueue::EnqueueHandler;
pub use events::{LogRecorder, MemoryRecorder, NoopRecorder, RecordedEvent, SUCCESS_SYNCED};
pub use reconciler::{ReconcileError, Reconciler};
pub use sync::wait_for_cache_sync;

use worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("timed out after {0:?} waiting for caches to sync")]
    SyncTimeout(Duration),
    #[error("stopped before caches synced")]
    SyncCancelled,
}

/// Shuts the queue down on every exit path of [`Controller::run`].
struct ShutdownOnDrop<'a>(&'a WorkQueue);

impl Drop for ShutdownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.shut_down();
    }
}

pub struct Controller {
    config: ControllerConfig,
    cache: ObjectCache,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    recorder: Arc<dyn EventRecorder>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        cache: ObjectCache,
        reconciler: Arc<dyn Reconciler>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::with_rate_limiter(config.name.clone(), config.rate_limiter()));
        Self { config, cache, queue, reconciler, recorder }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Observer to register with the informer feeding [`Self::cache`].
    pub fn observer(&self) -> Arc<dyn ChangeObserver> {
        Arc::new(EnqueueHandler::new(self.queue.clone()))
    }

    /// Wait for the cache to sync, then run `workers` reconcile loops until
    /// `stop` fires. Returns once every worker has finished its current key.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        if workers == 0 {
            return Err(ControllerError::NoWorkers);
        }
        let _shutdown = ShutdownOnDrop(&self.queue);

        info!(controller = %self.config.name, "starting controller");
        info!("waiting for informer caches to sync");
        wait_for_cache_sync(&[&self.cache], &stop, self.config.sync_timeout).await?;

        info!(workers, "starting workers");
        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                cache: self.cache.clone(),
                reconciler: self.reconciler.clone(),
                recorder: self.recorder.clone(),
            };
            set.spawn(worker.run());
        }
        info!("started workers");

        stop.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("workers stopped");
        Ok(())
    }
}
