//! Core data models for the updater
//!
//! These are cycle-scoped snapshots of cluster state. The control loop only
//! reads them; ownership and lifecycle belong to the cluster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CPU and memory requests of a single container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

impl ResourceRequests {
    pub fn new(cpu_millicores: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }
}

/// A container of a live pod with its current requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub requests: ResourceRequests,
}

/// Controller reference (the owner with `controller: true`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub api_version: String,
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// A live workload instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<ControllerKey>,
    pub containers: Vec<Container>,
    pub phase: PodPhase,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            uid: format!("{}/{}", namespace, name),
            name,
            namespace,
            labels: BTreeMap::new(),
            owner: None,
            containers: Vec::new(),
            phase: PodPhase::Running,
            creation_timestamp: None,
            deletion_timestamp: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_container(mut self, name: impl Into<String>, requests: ResourceRequests) -> Self {
        self.containers.push(Container {
            name: name.into(),
            requests,
        });
        self
    }

    pub fn with_owner(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.owner = Some(ControllerKey {
            namespace: self.namespace.clone(),
            kind: kind.into(),
            name: name.into(),
            api_version: String::new(),
        });
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new("Pod", &self.namespace, &self.name)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Reference to any namespaced object, used as the subject of events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Update policy of a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Never disrupt running pods
    Off,
    /// Resources are only assigned at pod creation by the admission side
    Initial,
    /// Disrupt by eviction only
    #[default]
    Auto,
    /// Try an in-place resize first, fall back to eviction
    InPlaceOrRecreate,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Off => "Off",
            UpdateMode::Initial => "Initial",
            UpdateMode::Auto => "Auto",
            UpdateMode::InPlaceOrRecreate => "InPlaceOrRecreate",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the workload controller a VPA targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
}

/// Min/max bounds a recommendation is capped to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerResourcePolicy {
    /// Container name, or `*` for every container without its own policy
    pub container_name: String,
    pub min_allowed: Option<ResourceRequests>,
    pub max_allowed: Option<ResourceRequests>,
}

/// Recommended requests for a single container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecommendation {
    pub container_name: String,
    pub target: ResourceRequests,
    pub lower_bound: Option<ResourceRequests>,
    pub upper_bound: Option<ResourceRequests>,
}

/// The workload policy object ("VPA")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpa {
    pub name: String,
    pub namespace: String,
    pub target_ref: Option<TargetRef>,
    pub update_mode: Option<UpdateMode>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_policy: Vec<ContainerResourcePolicy>,
    #[serde(default)]
    pub recommendation: Vec<ContainerRecommendation>,
}

impl Vpa {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            target_ref: None,
            update_mode: None,
            creation_timestamp: None,
            resource_policy: Vec::new(),
            recommendation: Vec::new(),
        }
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = Some(mode);
        self
    }

    pub fn with_creation_timestamp(mut self, created: DateTime<Utc>) -> Self {
        self.creation_timestamp = Some(created);
        self
    }

    pub fn with_target_ref(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.target_ref = Some(TargetRef {
            kind: kind.into(),
            name: name.into(),
            api_version: String::new(),
        });
        self
    }

    pub fn with_recommendation(
        mut self,
        container_name: impl Into<String>,
        target: ResourceRequests,
    ) -> Self {
        self.recommendation.push(ContainerRecommendation {
            container_name: container_name.into(),
            target,
            lower_bound: None,
            upper_bound: None,
        });
        self
    }

    pub fn with_policy(mut self, policy: ContainerResourcePolicy) -> Self {
        self.resource_policy.push(policy);
        self
    }

    /// Effective update mode; unset means Auto
    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode.unwrap_or_default()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new("VerticalPodAutoscaler", &self.namespace, &self.name)
    }

    pub fn recommendation_for(&self, container_name: &str) -> Option<&ContainerRecommendation> {
        self.recommendation
            .iter()
            .find(|r| r.container_name == container_name)
    }

    /// Policy for the container, falling back to the `*` wildcard entry
    pub fn policy_for(&self, container_name: &str) -> Option<&ContainerResourcePolicy> {
        self.resource_policy
            .iter()
            .find(|p| p.container_name == container_name)
            .or_else(|| {
                self.resource_policy
                    .iter()
                    .find(|p| p.container_name == "*")
            })
    }
}

/// Resource values the recommendation processor wants applied to a pod
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecommendedPodResources {
    pub containers: BTreeMap<String, ResourceRequests>,
}

/// A pod paired with the requests it should converge to
#[derive(Debug, Clone, PartialEq)]
pub struct PodWithTarget {
    pub pod: Pod,
    pub target: RecommendedPodResources,
}
