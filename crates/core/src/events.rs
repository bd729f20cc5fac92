use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reference to the object an audit event is about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRef {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

/// Best-effort audit sink. Recording must never fail the caller: sinks log
/// their own delivery errors and return.
pub trait EventRecorder: Send + Sync {
    fn record(&self, obj: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}
