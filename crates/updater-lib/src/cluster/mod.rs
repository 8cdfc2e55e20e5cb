//! Kubernetes-backed collaborators
//!
//! Thin adapters between the API server and the updater traits. All cluster
//! objects are converted into the plain models in [`crate::models`] right
//! after they are read.

mod controllers;
pub mod convert;
mod disruptor;
mod events;
mod lease;
mod listers;

pub use controllers::{KubeControllerFetcher, KubeSelectorFetcher};
pub use disruptor::KubePodDisruptor;
pub use events::{event_body, KubeEventSink};
pub use lease::LeaseStatusValidator;
pub use listers::{KubePodLister, KubeVpaLister};

use kube::core::{ApiResource, GroupVersionKind};
use thiserror::Error;

pub const VPA_GROUP: &str = "autoscaling.k8s.io";
pub const VPA_VERSION: &str = "v1";
pub const VPA_KIND: &str = "VerticalPodAutoscaler";

/// Failures while reading or converting cluster objects
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("invalid quantity: {0:?}")]
    InvalidQuantity(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown update mode: {0}")]
    UnknownUpdateMode(String),

    #[error("malformed VPA object {name}: {source}")]
    MalformedVpa {
        name: String,
        source: serde_json::Error,
    },

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("VPA {0} has no target reference")]
    NoTargetRef(String),

    #[error("{kind} {namespace}/{name} has no pod selector")]
    NoSelector {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("owner reference cycle at {0}")]
    OwnerCycle(String),
}

/// Controllers whose pod selector and owner chain are read directly
pub fn well_known_api_version(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" => Some("apps/v1"),
        "Job" | "CronJob" => Some("batch/v1"),
        "ReplicationController" => Some("v1"),
        _ => None,
    }
}

/// Build an `ApiResource` from an `apiVersion` and kind
///
/// Well-known kinds always use their stable version, whatever `api_version`
/// says. An empty `api_version` on an unknown kind is treated as core `v1`.
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let api_version = well_known_api_version(kind).unwrap_or(match api_version {
        "" => "v1",
        other => other,
    });
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

pub fn vpa_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(VPA_GROUP, VPA_VERSION, VPA_KIND))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_resource() {
        let deploy = api_resource("extensions/v1beta1", "Deployment");
        assert_eq!(deploy.group, "apps");
        assert_eq!(deploy.version, "v1");
        assert_eq!(deploy.plural, "deployments");

        let rc = api_resource("", "ReplicationController");
        assert_eq!(rc.group, "");
        assert_eq!(rc.api_version, "v1");

        let custom = api_resource("argoproj.io/v1alpha1", "Rollout");
        assert_eq!(custom.group, "argoproj.io");
        assert_eq!(custom.plural, "rollouts");

        let vpa = vpa_api_resource();
        assert_eq!(vpa.plural, "verticalpodautoscalers");
    }
}
