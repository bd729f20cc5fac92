use std::time::Duration;

use recon_store::ObjectCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ControllerError;

/// Block until every cache has applied its initial listing.
///
/// Fails when `stop` fires first or when `timeout` elapses. A cache that is
/// already synced returns immediately.
pub async fn wait_for_cache_sync(
    caches: &[&ObjectCache],
    stop: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), ControllerError> {
    let all_synced = async {
        for (i, cache) in caches.iter().enumerate() {
            let mut rx = cache.subscribe_synced();
            if rx.wait_for(|synced| *synced).await.is_err() {
                // the sender lives as long as the cache, so this cannot resolve
                std::future::pending::<()>().await;
            }
            debug!(cache = i, "cache synced");
        }
    };
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = all_synced => {
            info!(caches = caches.len(), "caches synced");
            Ok(())
        }
        _ = stop.cancelled() => Err(ControllerError::SyncCancelled),
        _ = deadline => Err(ControllerError::SyncTimeout(timeout.unwrap_or_default())),
    }
}
