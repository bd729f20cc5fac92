//! Recon core types: desired-state objects, work keys and change notifications.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod events;
mod key;

pub use events::{EventRecorder, EventType, ObjectRef};
pub use key::{deletion_key, meta_namespace_key, Key, KeyError};

/// A desired-state record mirrored from the source of truth.
///
/// Identity (`namespace`, `name`) and the version token are lifted out of
/// `metadata`; everything else stays in `raw` for the reconciler to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Raw object (possibly stripped of oversized fields under feature flags)
    pub raw: serde_json::Value,
}

impl Object {
    /// Build an object from its JSON form. Missing identity fields are left
    /// empty; key extraction is where malformed identity gets rejected.
    pub fn from_raw(mut raw: serde_json::Value) -> Self {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);

        let str_at = |v: &serde_json::Value, k: &str| v.get(k).and_then(|s| s.as_str()).map(str::to_string);
        let meta = raw.get("metadata").cloned().unwrap_or(serde_json::Value::Null);
        Self {
            api_version: str_at(&raw, "apiVersion"),
            kind: str_at(&raw, "kind"),
            namespace: str_at(&meta, "namespace").filter(|ns| !ns.is_empty()),
            name: str_at(&meta, "name").unwrap_or_default(),
            uid: str_at(&meta, "uid"),
            resource_version: str_at(&meta, "resourceVersion"),
            raw,
        }
    }

    pub fn key(&self) -> Result<Key, KeyError> {
        meta_namespace_key(self)
    }

    /// The `spec` block, if the object carries one.
    pub fn spec(&self) -> Option<&serde_json::Value> {
        self.raw.get("spec")
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            resource_version: self.resource_version.clone(),
        }
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Last-known state of an object that has left the cache.
#[derive(Debug, Clone)]
pub enum Tombstone {
    /// The delete was observed directly.
    Final(Arc<Object>),
    /// The object vanished from a relist; the delete itself was missed.
    StateUnknown { key: Key, last_known: Arc<Object> },
}

impl Tombstone {
    pub fn object(&self) -> &Arc<Object> {
        match self {
            Tombstone::Final(obj) => obj,
            Tombstone::StateUnknown { last_known, .. } => last_known,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Transient trigger for an enqueue. Carries no object state on purpose:
/// by the time a worker runs the cache may have moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: Key,
    pub kind: ChangeKind,
}

/// A change accepted by the object cache.
#[derive(Debug, Clone)]
pub enum Change {
    Added(Arc<Object>),
    Updated { old: Arc<Object>, new: Arc<Object> },
    /// Periodic re-delivery of an unchanged cached object.
    Resynced(Arc<Object>),
    Deleted(Tombstone),
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Added(_) => ChangeKind::Added,
            Change::Updated { .. } | Change::Resynced(_) => ChangeKind::Updated,
            Change::Deleted(_) => ChangeKind::Deleted,
        }
    }

    pub fn key(&self) -> Result<Key, KeyError> {
        match self {
            Change::Added(obj) | Change::Resynced(obj) => meta_namespace_key(obj),
            Change::Updated { new, .. } => meta_namespace_key(new),
            Change::Deleted(t) => deletion_key(t),
        }
    }

    pub fn notification(&self) -> Result<Notification, KeyError> {
        Ok(Notification { key: self.key()?, kind: self.kind() })
    }
}

/// Receives every change the cache accepts. Invoked from the feed task, so
/// implementations must not block.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, change: Change);
}

impl<F> ChangeObserver for F
where
    F: Fn(Change) + Send + Sync,
{
    fn on_change(&self, change: Change) {
        self(change)
    }
}

pub mod prelude {
    pub use super::{
        Change, ChangeKind, ChangeObserver, EventRecorder, EventType, Key, KeyError, Notification, Object,
        ObjectRef, Tombstone,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(ns: Option<&str>, name: &str, rv: &str) -> Object {
        let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv, "managedFields": [{}] });
        if let Some(ns) = ns {
            meta["namespace"] = serde_json::Value::String(ns.to_string());
        }
        Object::from_raw(serde_json::json!({
            "apiVersion": "example.com/v1alpha1",
            "kind": "User",
            "metadata": meta,
            "spec": { "email": "foo@example.com" },
        }))
    }

    #[test]
    fn from_raw_lifts_identity_and_strips_managed_fields() {
        let obj = user(Some("default"), "foo", "7");
        assert_eq!(obj.namespace.as_deref(), Some("default"));
        assert_eq!(obj.name, "foo");
        assert_eq!(obj.resource_version.as_deref(), Some("7"));
        assert_eq!(obj.kind.as_deref(), Some("User"));
        assert!(obj.raw["metadata"].get("managedFields").is_none());
        assert_eq!(obj.spec().and_then(|s| s.get("email")).and_then(|v| v.as_str()), Some("foo@example.com"));
    }

    #[test]
    fn change_kinds_and_keys() {
        let a = Arc::new(user(Some("default"), "foo", "1"));
        let b = Arc::new(user(Some("default"), "foo", "2"));
        let up = Change::Updated { old: a.clone(), new: b };
        assert_eq!(up.kind(), ChangeKind::Updated);
        assert_eq!(up.key().unwrap().as_str(), "default/foo");
        assert_eq!(Change::Resynced(a.clone()).kind(), ChangeKind::Updated);

        let gone = Change::Deleted(Tombstone::StateUnknown { key: Key::new("default/foo"), last_known: a });
        let n = gone.notification().unwrap();
        assert_eq!(n.kind, ChangeKind::Deleted);
        assert_eq!(n.key.as_str(), "default/foo");
    }

    #[test]
    fn nameless_object_has_no_key() {
        let obj = Object::from_raw(serde_json::json!({ "metadata": { "namespace": "default" } }));
        assert_eq!(obj.key(), Err(KeyError::MissingName));
    }
}
