//! Recon store: the read-optimized object cache and the informer that keeps it current.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use recon_core::{meta_namespace_key, Change, Key, Object, Tombstone};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::warn;

mod feed;
mod informer;

pub use feed::{ChannelFeed, Feed, WatchEvent};
pub use informer::{Informer, InformerConfig};

struct Inner {
    items: RwLock<FxHashMap<Key, Arc<Object>>>,
    synced: watch::Sender<bool>,
}

/// Local mirror of the remote collection, keyed by `namespace/name`.
///
/// Updates are last-write-wins in delivery order; version tokens are never
/// compared here. The informer is the only writer.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<Inner>,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { inner: Arc::new(Inner { items: RwLock::new(FxHashMap::default()), synced }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<Key, Arc<Object>>> {
        self.inner.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<Key, Arc<Object>>> {
        self.inner.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &Key) -> Option<Arc<Object>> {
        self.read().get(key).cloned()
    }

    /// True once the initial full listing has been applied. Never reverts.
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.inner.synced.subscribe()
    }

    pub fn list(&self) -> Vec<Arc<Object>> {
        self.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_synced(&self) {
        self.inner.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
    }

    pub(crate) fn upsert(&self, obj: Object) -> Option<Change> {
        let key = keyed(&obj)?;
        let new = Arc::new(obj);
        Some(match self.write().insert(key, new.clone()) {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        })
    }

    /// Deletions are always reported, even for objects the cache never saw.
    pub(crate) fn remove(&self, obj: Object) -> Option<Change> {
        let key = keyed(&obj)?;
        self.write().remove(&key);
        Some(Change::Deleted(Tombstone::Final(Arc::new(obj))))
    }

    /// Swap in a full listing. Objects missing from it come back as
    /// unknown-state tombstones since their delete was never observed.
    pub(crate) fn replace(&self, objects: Vec<Object>) -> Vec<Change> {
        let mut next: FxHashMap<Key, Arc<Object>> = FxHashMap::default();
        for obj in objects {
            if let Some(key) = keyed(&obj) {
                next.insert(key, Arc::new(obj));
            }
        }

        let mut items = self.write();
        let mut changes = Vec::with_capacity(next.len());
        for (key, new) in next.iter() {
            changes.push(match items.get(key) {
                Some(old) => Change::Updated { old: old.clone(), new: new.clone() },
                None => Change::Added(new.clone()),
            });
        }
        for (key, last_known) in items.iter() {
            if !next.contains_key(key) {
                changes.push(Change::Deleted(Tombstone::StateUnknown { key: key.clone(), last_known: last_known.clone() }));
            }
        }
        *items = next;
        changes
    }

    pub(crate) fn resync(&self) -> Vec<Change> {
        self.read().values().map(|obj| Change::Resynced(obj.clone())).collect()
    }
}

fn keyed(obj: &Object) -> Option<Key> {
    match meta_namespace_key(obj) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, namespace = ?obj.namespace, "dropping object with malformed identity");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::ChangeKind;

    fn obj(ns: &str, name: &str, rv: &str) -> Object {
        Object::from_raw(serde_json::json!({
            "metadata": { "namespace": ns, "name": name, "resourceVersion": rv }
        }))
    }

    #[test]
    fn upsert_reports_add_then_update() {
        let cache = ObjectCache::new();
        assert!(matches!(cache.upsert(obj("ns", "a", "1")), Some(Change::Added(_))));
        match cache.upsert(obj("ns", "a", "2")) {
            Some(Change::Updated { old, new }) => {
                assert_eq!(old.resource_version.as_deref(), Some("1"));
                assert_eq!(new.resource_version.as_deref(), Some("2"));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_write_wins_regardless_of_version() {
        let cache = ObjectCache::new();
        cache.upsert(obj("ns", "a", "9"));
        cache.upsert(obj("ns", "a", "3"));
        let got = cache.get(&Key::new("ns/a")).unwrap();
        assert_eq!(got.resource_version.as_deref(), Some("3"));
    }

    #[test]
    fn malformed_identity_is_dropped() {
        let cache = ObjectCache::new();
        assert!(cache.upsert(obj("ns", "", "1")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn replace_diffs_against_previous_contents() {
        let cache = ObjectCache::new();
        cache.upsert(obj("ns", "keep", "1"));
        cache.upsert(obj("ns", "gone", "1"));

        let changes = cache.replace(vec![obj("ns", "keep", "1"), obj("ns", "new", "1")]);
        let mut kinds: Vec<(String, ChangeKind)> =
            changes.iter().map(|c| (c.key().unwrap().to_string(), c.kind())).collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            kinds,
            vec![
                ("ns/gone".to_string(), ChangeKind::Deleted),
                ("ns/keep".to_string(), ChangeKind::Updated),
                ("ns/new".to_string(), ChangeKind::Added),
            ]
        );
        let gone = changes.iter().find(|c| c.kind() == ChangeKind::Deleted).unwrap();
        assert!(matches!(gone, Change::Deleted(Tombstone::StateUnknown { .. })));
        assert_eq!(cache.keys(), vec![Key::new("ns/keep"), Key::new("ns/new")]);
    }

    #[test]
    fn synced_flag_latches() {
        let cache = ObjectCache::new();
        let rx = cache.subscribe_synced();
        assert!(!cache.has_synced());
        cache.mark_synced();
        cache.mark_synced();
        assert!(cache.has_synced());
        assert!(*rx.borrow());
    }
}
