use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use recon_core::{EventRecorder, EventType, Key, ObjectRef};
use recon_queue::WorkQueue;
use recon_store::ObjectCache;
use tracing::{debug, error, info, warn};

use crate::events::SUCCESS_SYNCED;
use crate::reconciler::Reconciler;

/// Marks the key done however processing ends, unwinding included.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    key: &'a Key,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) cache: ObjectCache,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
}

impl Worker {
    pub(crate) async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next().await {}
        debug!(worker = self.id, "worker stopped");
    }

    /// Handle one key. Returns false once the queue is shut down and empty.
    async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _in_flight = InFlight { queue: &self.queue, key: &key };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key)).catch_unwind().await;
        histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(())) => {
                self.queue.forget(&key);
                counter!("reconcile_total", 1u64, "result" => "success");
                info!(worker = self.id, key = %key, "successfully synced");
                self.record(&key, EventType::Normal, SUCCESS_SYNCED, |kind| format!("{kind} synced successfully"));
            }
            Ok(Err(e)) if e.is_permanent() => {
                self.queue.forget(&key);
                counter!("reconcile_total", 1u64, "result" => "permanent");
                error!(worker = self.id, key = %key, error = %e, "dropping key after permanent failure");
                self.record(&key, EventType::Warning, e.reason(), |_| e.to_string());
            }
            Ok(Err(e)) => {
                self.queue.add_rate_limited(key.clone());
                counter!("reconcile_total", 1u64, "result" => "transient");
                counter!("workqueue_retries_total", 1u64, "queue" => self.queue.name().to_string());
                warn!(
                    worker = self.id,
                    key = %key,
                    retries = self.queue.num_requeues(&key),
                    error = %e,
                    "error syncing; requeued with backoff"
                );
            }
            Err(panic) => {
                self.queue.add_rate_limited(key.clone());
                counter!("reconcile_total", 1u64, "result" => "panic");
                counter!("workqueue_retries_total", 1u64, "queue" => self.queue.name().to_string());
                error!(worker = self.id, key = %key, panic = panic_message(&*panic), "reconciler panicked; requeued with backoff");
            }
        }
        true
    }

    /// Objects that are gone from the cache are referenced by their key.
    fn record(&self, key: &Key, event_type: EventType, reason: &str, message: impl FnOnce(&str) -> String) {
        let (object, kind) = match self.cache.get(key) {
            Some(obj) => (obj.object_ref(), obj.kind.clone()),
            None => (key_ref(key), None),
        };
        let message = message(kind.as_deref().unwrap_or("Object"));
        self.recorder.record(&object, event_type, reason, &message);
    }
}

/// A key that does not split is used whole as the name.
fn key_ref(key: &Key) -> ObjectRef {
    match key.split() {
        Ok((namespace, name)) => {
            ObjectRef { namespace: namespace.map(str::to_string), name: name.to_string(), ..ObjectRef::default() }
        }
        Err(_) => ObjectRef { name: key.to_string(), ..ObjectRef::default() },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
