use recon_core::{Key, KeyError};

/// Business logic that drives the external system toward the cached desired
/// state for one key.
///
/// Implementations re-read the object from the cache themselves and must be
/// idempotent. A key missing from the cache means the object was deleted:
/// clean up and return `Ok(())`, or an error to have the cleanup retried.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &Key) -> Result<(), ReconcileError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The key does not parse into namespace/name. Never retried.
    #[error("invalid resource key: {0}")]
    InvalidKey(#[from] KeyError),
    /// Retrying cannot succeed. The key is forgotten.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Requeued with backoff.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn transient(e: impl Into<anyhow::Error>) -> Self {
        Self::Transient(e.into())
    }

    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }

    /// Event reason used when the failure is reported to the audit sink.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "InvalidKey",
            Self::Permanent(_) => "ReconcileFailed",
            Self::Transient(_) => "ReconcileError",
        }
    }
}
