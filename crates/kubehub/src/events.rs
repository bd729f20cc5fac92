use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use metrics::counter;
use recon_core::{EventRecorder, EventType, ObjectRef};
use tracing::warn;

/// Publishes audit events as Kubernetes Events. Publishing runs on its own
/// task so a slow or failing API server never holds up a worker.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }
}

fn object_reference(obj: &ObjectRef) -> ObjectReference {
    ObjectReference {
        api_version: obj.api_version.clone(),
        kind: obj.kind.clone(),
        namespace: obj.namespace.clone(),
        name: Some(obj.name.clone()),
        uid: obj.uid.clone(),
        resource_version: obj.resource_version.clone(),
        ..ObjectReference::default()
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, obj: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(obj));
        let event = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        let name = obj.name.clone();
        tokio::spawn(async move {
            match recorder.publish(event).await {
                Ok(()) => counter!("events_published_total", 1u64),
                Err(e) => {
                    counter!("events_publish_errors_total", 1u64);
                    warn!(error = %e, object = %name, "failed to publish event");
                }
            }
        });
    }
}
