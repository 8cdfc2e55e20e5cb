//! Kubernetes Events for disrupted pods
//!
//! Events are queued without blocking and created by a background task. A
//! full queue or a rejected create only costs the event, never the eviction
//! or resize it describes.

use super::{well_known_api_version, VPA_GROUP, VPA_KIND, VPA_VERSION};
use crate::events::{EventSink, EventType, TracingEventSink};
use crate::models::ObjectRef;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_QUEUE_SIZE: usize = 256;

fn api_version_of(kind: &str) -> String {
    match kind {
        "Pod" => "v1".to_string(),
        VPA_KIND => format!("{}/{}", VPA_GROUP, VPA_VERSION),
        other => well_known_api_version(other).unwrap_or("v1").to_string(),
    }
}

/// Build a core/v1 Event about `object`
pub fn event_body(
    component: &str,
    object: &ObjectRef,
    event_type: EventType,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Event {
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", object.name)),
            namespace: Some(object.namespace.clone()),
            ..ObjectMeta::default()
        },
        involved_object: ObjectReference {
            api_version: Some(api_version_of(&object.kind)),
            kind: Some(object.kind.clone()),
            namespace: Some(object.namespace.clone()),
            name: Some(object.name.clone()),
            ..ObjectReference::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        source: Some(EventSource {
            component: Some(component.to_string()),
            host: None,
        }),
        reporting_component: Some(component.to_string()),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Event::default()
    }
}

/// Event sink that publishes Kubernetes Events and logs them
#[derive(Clone)]
pub struct KubeEventSink {
    component: String,
    sender: mpsc::Sender<Event>,
    log: TracingEventSink,
}

impl KubeEventSink {
    /// Start the publishing task; it ends once every sink clone is dropped
    pub fn spawn(client: Client, component: impl Into<String>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(EVENT_QUEUE_SIZE);
        let handle = tokio::spawn(publish_events(client, receiver));
        (Self::with_sender(component, sender), handle)
    }

    fn with_sender(component: impl Into<String>, sender: mpsc::Sender<Event>) -> Self {
        let component = component.into();
        Self {
            log: TracingEventSink::new(component.clone()),
            component,
            sender,
        }
    }
}

impl EventSink for KubeEventSink {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        self.log.event(object, event_type, reason, message);

        let event = event_body(
            &self.component,
            object,
            event_type,
            reason,
            message,
            Utc::now(),
        );
        if let Err(e) = self.sender.try_send(event) {
            warn!(object = %object, reason, error = %e, "Dropping Kubernetes event");
        }
    }
}

async fn publish_events(client: Client, mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        let namespace = event.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Event> = Api::namespaced(client.clone(), &namespace);
        match api.create(&PostParams::default(), &event).await {
            Ok(_) => debug!(reason = ?event.reason, "Kubernetes event created"),
            Err(e) => warn!(
                reason = ?event.reason,
                object = ?event.involved_object.name,
                error = %e,
                "Failed to create Kubernetes event"
            ),
        }
    }
}
