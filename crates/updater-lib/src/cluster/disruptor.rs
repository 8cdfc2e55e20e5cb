//! Eviction and in-place resize calls

use crate::models::{Pod, RecommendedPodResources};
use crate::restriction::PodDisruptor;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as KubePod;
use kube::api::{Api, EvictParams, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

/// Body for the pod `resize` subresource, one entry per container with a target
pub fn resize_patch(target: &RecommendedPodResources) -> Value {
    let containers: Vec<Value> = target
        .containers
        .iter()
        .map(|(name, requests)| {
            json!({
                "name": name,
                "resources": {
                    "requests": {
                        "cpu": format!("{}m", requests.cpu_millicores),
                        "memory": requests.memory_bytes.to_string(),
                    }
                }
            })
        })
        .collect();

    json!({ "spec": { "containers": containers } })
}

/// Disrupts pods through the Eviction API and the `resize` subresource
#[derive(Clone)]
pub struct KubePodDisruptor {
    client: Client,
}

impl KubePodDisruptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<KubePod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodDisruptor for KubePodDisruptor {
    async fn evict(&self, pod: &Pod) -> anyhow::Result<()> {
        self.api(&pod.namespace)
            .evict(&pod.name, &EvictParams::default())
            .await?;
        debug!(pod = %pod.object_ref(), "Eviction accepted");
        Ok(())
    }

    async fn resize(&self, pod: &Pod, target: &RecommendedPodResources) -> anyhow::Result<()> {
        let patch = resize_patch(target);
        self.api(&pod.namespace)
            .patch_subresource(
                "resize",
                &pod.name,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await?;
        debug!(pod = %pod.object_ref(), "Resize accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceRequests;

    #[test]
    fn test_resize_patch() {
        let mut target = RecommendedPodResources::default();
        target
            .containers
            .insert("app".to_string(), ResourceRequests::new(1500, 268435456));

        let patch = resize_patch(&target);

        assert_eq!(
            patch,
            json!({"spec": {"containers": [
                {"name": "app", "resources": {"requests": {"cpu": "1500m", "memory": "268435456"}}}
            ]}})
        );
    }
}
