use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge};
use recon_core::{Change, ChangeKind, ChangeObserver};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Feed, ObjectCache, WatchEvent};

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Re-deliver every cached object this often. `None` disables resync.
    pub resync_period: Option<Duration>,
    pub relist_backoff_base: Duration,
    pub relist_backoff_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(30)),
            relist_backoff_base: Duration::from_millis(500),
            relist_backoff_max: Duration::from_secs(30),
        }
    }
}

/// The feed task: lists, watches and periodically resyncs into the cache,
/// handing every accepted change to the observer in delivery order.
pub struct Informer {
    feed: Arc<dyn Feed>,
    cache: ObjectCache,
    observer: Arc<dyn ChangeObserver>,
    config: InformerConfig,
}

impl Informer {
    pub fn new(feed: Arc<dyn Feed>, cache: ObjectCache, observer: Arc<dyn ChangeObserver>) -> Self {
        Self { feed, cache, observer, config: InformerConfig::default() }
    }

    pub fn with_config(mut self, config: InformerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Run until `stop` fires.
    pub async fn run(self, stop: CancellationToken) {
        info!(resync = ?self.config.resync_period, "informer started");
        let mut backoff = self.config.relist_backoff_base;

        'relist: loop {
            let listed = tokio::select! {
                _ = stop.cancelled() => break,
                listed = self.feed.list_all() => listed,
            };
            let objects = match listed {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "list failed");
                    if !sleep_or_stop(backoff, &stop).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.relist_backoff_max);
                    continue;
                }
            };
            counter!("informer_relists_total", 1u64);
            debug!(count = objects.len(), "listed");
            self.deliver(self.cache.replace(objects));
            self.cache.mark_synced();
            backoff = self.config.relist_backoff_base;

            let mut stream = self.feed.watch();
            let mut resync = self.config.resync_period.map(|p| tokio::time::interval_at(Instant::now() + p, p));
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break 'relist,
                    ev = stream.next() => match ev {
                        Some(Ok(WatchEvent::Applied(obj))) => self.deliver(self.cache.upsert(obj)),
                        Some(Ok(WatchEvent::Deleted(obj))) => self.deliver(self.cache.remove(obj)),
                        Some(Ok(WatchEvent::Restarted(objects))) => {
                            debug!(count = objects.len(), "watch restart");
                            self.deliver(self.cache.replace(objects));
                        }
                        Some(Err(e)) => {
                            counter!("informer_watch_errors_total", 1u64);
                            warn!(error = %e, "watch error");
                        }
                        None => {
                            warn!("watch stream ended; relisting");
                            if !sleep_or_stop(backoff, &stop).await {
                                break 'relist;
                            }
                            continue 'relist;
                        }
                    },
                    _ = tick(&mut resync) => {
                        let changes = self.cache.resync();
                        debug!(count = changes.len(), "resync");
                        self.deliver(changes);
                    }
                }
            }
        }
        info!("informer stopped");
    }

    fn deliver(&self, changes: impl IntoIterator<Item = Change>) {
        for change in changes {
            let kind = match (&change, change.kind()) {
                (Change::Resynced(_), _) => "resync",
                (_, ChangeKind::Added) => "added",
                (_, ChangeKind::Updated) => "updated",
                (_, ChangeKind::Deleted) => "deleted",
            };
            counter!("informer_events_total", 1u64, "kind" => kind);
            self.observer.on_change(change);
        }
        gauge!("informer_cache_objects", self.cache.len() as f64);
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleep unless stopped first. Returns false on stop.
async fn sleep_or_stop(delay: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
