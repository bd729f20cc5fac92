use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use recon_core::{EventRecorder, EventType, ObjectRef};
use tracing::{info, warn};

/// Reason attached to the event recorded after a successful reconcile.
pub const SUCCESS_SYNCED: &str = "Synced";

/// Writes audit events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, obj: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        let kind = obj.kind.as_deref().unwrap_or_default();
        let ns = obj.namespace.as_deref().unwrap_or_default();
        match event_type {
            EventType::Normal => info!(kind, ns, name = %obj.name, reason, note = message, "event"),
            EventType::Warning => warn!(kind, ns, name = %obj.name, reason, note = message, "event"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl EventRecorder for NoopRecorder {
    fn record(&self, _obj: &ObjectRef, _event_type: EventType, _reason: &str, _message: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: ObjectRef,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Keeps every event in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, obj: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        let event = RecordedEvent {
            object: obj.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        };
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
