use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use metrics::counter;
use recon_controller::{ReconcileError, Reconciler};
use recon_core::Key;
use recon_store::ObjectCache;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRecord {
    pub resource_version: Option<String>,
    pub spec: serde_json::Value,
}

/// Copies each object's spec into an in-memory table, standing in for an
/// external system. Writes only happen when the table differs from the cache.
pub struct MirrorReconciler {
    cache: ObjectCache,
    table: Mutex<BTreeMap<Key, MirrorRecord>>,
    writes: AtomicU64,
}

impl MirrorReconciler {
    pub fn new(cache: ObjectCache) -> Self {
        Self { cache, table: Mutex::new(BTreeMap::new()), writes: AtomicU64::new(0) }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<Key, MirrorRecord>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> BTreeMap<Key, MirrorRecord> {
        self.table().clone()
    }

    /// Number of create, update and delete operations applied so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn wrote(&self, op: &'static str) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        counter!("mirror_writes_total", 1u64, "op" => op);
    }
}

#[async_trait::async_trait]
impl Reconciler for MirrorReconciler {
    async fn reconcile(&self, key: &Key) -> Result<(), ReconcileError> {
        let (ns, name) = key.split()?;
        let ns = ns.unwrap_or_default();

        let Some(obj) = self.cache.get(key) else {
            if self.table().remove(key).is_some() {
                self.wrote("delete");
                info!(ns, name, "removed mirrored record");
            }
            return Ok(());
        };
        let spec = obj
            .spec()
            .cloned()
            .ok_or_else(|| ReconcileError::Permanent(format!("{key} has no spec")))?;
        let record = MirrorRecord { resource_version: obj.resource_version.clone(), spec };

        let mut table = self.table();
        let op = match table.get(key) {
            Some(existing) if existing.spec == record.spec => None,
            Some(_) => Some("update"),
            None => Some("create"),
        };
        table.insert(key.clone(), record);
        drop(table);
        match op {
            Some(op) => {
                self.wrote(op);
                info!(ns, name, op, "mirrored");
            }
            None => debug!(ns, name, "mirror up to date"),
        }
        Ok(())
    }
}
