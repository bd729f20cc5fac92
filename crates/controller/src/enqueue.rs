use std::sync::Arc;

use recon_core::{Change, ChangeObserver};
use recon_queue::WorkQueue;
use tracing::{debug, trace, warn};

/// Turns cache changes into rate-limited enqueues of their keys.
pub struct EnqueueHandler {
    queue: Arc<WorkQueue>,
}

impl EnqueueHandler {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

impl ChangeObserver for EnqueueHandler {
    fn on_change(&self, change: Change) {
        // Two different versions of the same object always have different
        // version tokens. Periodic resyncs arrive as `Resynced` and are not
        // subject to this check.
        if let Change::Updated { old, new } = &change {
            if old.resource_version.is_some() && old.resource_version == new.resource_version {
                trace!(name = %new.name, "skipping update with unchanged version");
                return;
            }
        }
        match change.notification() {
            Ok(n) => {
                debug!(key = %n.key, kind = ?n.kind, "enqueue");
                self.queue.add_rate_limited(n.key);
            }
            Err(e) => warn!(error = %e, "could not compute key; dropping notification"),
        }
    }
}
