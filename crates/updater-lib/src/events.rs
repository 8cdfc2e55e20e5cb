//! Human-readable events about disrupted pods
//!
//! Emitting an event never fails the action it describes.

use crate::models::ObjectRef;
use std::fmt;
use tracing::{info, warn};

/// Event severity, matching the Kubernetes `Normal`/`Warning` types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// Reasons attached to updater events
pub mod reasons {
    pub const EVICTED_POD: &str = "EvictedPod";
    pub const EVICTED_BY_VPA: &str = "EvictedByVPA";
    pub const IN_PLACE_RESIZED: &str = "InPlaceResizedByVPA";
    pub const IN_PLACE_RESIZED_POD: &str = "InPlaceResizedPod";
}

/// Sink for events keyed by reason, message and type against an object
pub trait EventSink: Send + Sync {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}

/// Event sink that writes events to the structured log
#[derive(Debug, Clone)]
pub struct TracingEventSink {
    component: String,
}

impl TracingEventSink {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl Default for TracingEventSink {
    fn default() -> Self {
        Self::new("vpa-updater")
    }
}

impl EventSink for TracingEventSink {
    fn event(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                event = "k8s_event",
                component = %self.component,
                kind = %object.kind,
                object = %object,
                reason = %reason,
                "{}", message
            ),
            EventType::Warning => warn!(
                event = "k8s_event",
                component = %self.component,
                kind = %object.kind,
                object = %object,
                reason = %reason,
                "{}", message
            ),
        }
    }
}
