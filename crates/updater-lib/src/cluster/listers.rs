//! Cluster-wide listers for VPA objects and pods

use super::convert::{pod_from_kube, vpa_from_dynamic};
use super::vpa_api_resource;
use crate::models::{Pod, Vpa};
use crate::updater::{PodLister, VpaLister};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as KubePod;
use kube::api::{Api, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

/// Lists `VerticalPodAutoscaler` objects in all namespaces
///
/// Objects that cannot be converted are logged and left out, so one broken
/// VPA does not stop the others.
#[derive(Clone)]
pub struct KubeVpaLister {
    api: Api<DynamicObject>,
}

impl KubeVpaLister {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all_with(client, &vpa_api_resource()),
        }
    }
}

#[async_trait]
impl VpaLister for KubeVpaLister {
    async fn list(&self) -> anyhow::Result<Vec<Vpa>> {
        let objects = self.api.list(&ListParams::default()).await?;

        let mut vpas = Vec::with_capacity(objects.items.len());
        for obj in &objects.items {
            match vpa_from_dynamic(obj) {
                Ok(vpa) => vpas.push(vpa),
                Err(e) => warn!(
                    namespace = %obj.namespace().unwrap_or_default(),
                    name = %obj.name_any(),
                    error = %e,
                    "Ignoring VPA object that cannot be read"
                ),
            }
        }

        debug!(count = vpas.len(), "Listed VPA objects");
        Ok(vpas)
    }
}

/// Lists pods in all namespaces
#[derive(Clone)]
pub struct KubePodLister {
    api: Api<KubePod>,
}

impl KubePodLister {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list(&self) -> anyhow::Result<Vec<Pod>> {
        let pods = self.api.list(&ListParams::default()).await?;

        let mut result = Vec::with_capacity(pods.items.len());
        for pod in &pods.items {
            match pod_from_kube(pod) {
                Ok(converted) => result.push(converted),
                Err(e) => warn!(
                    namespace = %pod.namespace().unwrap_or_default(),
                    pod = %pod.name_any(),
                    error = %e,
                    "Ignoring pod that cannot be read"
                ),
            }
        }

        debug!(count = result.len(), "Listed pods");
        Ok(result)
    }
}
