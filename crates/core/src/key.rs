use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Object, Tombstone};

/// Work queue identity of an object: `namespace/name`, or `name` for
/// cluster-scoped objects. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Arc<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

impl Key {
    /// Wrap an arbitrary string. No validation happens here; see [`Key::split`].
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    pub fn from_parts(namespace: Option<&str>, name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::MissingName);
        }
        if name.contains('/') || namespace.is_some_and(|ns| ns.contains('/')) {
            return Err(KeyError::Malformed(format!("{}/{}", namespace.unwrap_or(""), name)));
        }
        Ok(match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name).into()),
            _ => Self(name.into()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(namespace, name)`. Cluster-scoped keys have no namespace.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, *name)),
            [ns, name] if !name.is_empty() => Ok(((!ns.is_empty()).then_some(*ns), *name)),
            _ => Err(KeyError::Malformed(self.0.to_string())),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", &*self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Key for a live object.
pub fn meta_namespace_key(obj: &Object) -> Result<Key, KeyError> {
    Key::from_parts(obj.namespace.as_deref(), &obj.name)
}

/// Key for a deleted object. Unknown-state tombstones already carry theirs.
pub fn deletion_key(tombstone: &Tombstone) -> Result<Key, KeyError> {
    match tombstone {
        Tombstone::StateUnknown { key, .. } => Ok(key.clone()),
        Tombstone::Final(obj) => meta_namespace_key(obj),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_and_cluster_keys() {
        assert_eq!(Key::from_parts(Some("default"), "foo").unwrap().as_str(), "default/foo");
        assert_eq!(Key::from_parts(None, "node-1").unwrap().as_str(), "node-1");
        assert_eq!(Key::from_parts(Some(""), "node-1").unwrap().as_str(), "node-1");
    }

    #[test]
    fn split_accepts_one_or_two_segments() {
        assert_eq!(Key::new("default/foo").split(), Ok((Some("default"), "foo")));
        assert_eq!(Key::new("node-1").split(), Ok((None, "node-1")));
        assert_eq!(Key::new("/foo").split(), Ok((None, "foo")));
    }

    #[test]
    fn split_rejects_malformed() {
        for bad in ["a/b/c", "", "default/"] {
            assert!(matches!(Key::new(bad).split(), Err(KeyError::Malformed(_))), "{bad:?}");
        }
    }

    #[test]
    fn identity_with_separator_is_malformed() {
        assert!(matches!(Key::from_parts(Some("a/b"), "c"), Err(KeyError::Malformed(_))));
        assert_eq!(Key::from_parts(Some("default"), ""), Err(KeyError::MissingName));
    }

    #[test]
    fn deletion_key_prefers_tombstone_key() {
        let obj = Arc::new(Object::from_raw(serde_json::json!({ "metadata": { "name": "" } })));
        let t = Tombstone::StateUnknown { key: Key::new("default/foo"), last_known: obj.clone() };
        assert_eq!(deletion_key(&t).unwrap().as_str(), "default/foo");
        assert_eq!(deletion_key(&Tombstone::Final(obj)), Err(KeyError::MissingName));
    }
}
