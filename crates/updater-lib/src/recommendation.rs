//! Per-pod recommendation processing
//!
//! Turns the VPA's per-container recommendation into the concrete requests a
//! pod should have, after applying the VPA's resource policy.

use crate::models::{Pod, RecommendedPodResources, ResourceRequests, Vpa};

/// Computes the requests to apply to a pod, or `None` when nothing changes
pub trait RecommendationProcessor: Send + Sync {
    fn apply(&self, vpa: &Vpa, pod: &Pod) -> anyhow::Result<Option<RecommendedPodResources>>;
}

/// Caps recommendation targets into the container resource policy bounds
#[derive(Debug, Default, Clone)]
pub struct CappingRecommendationProcessor;

impl CappingRecommendationProcessor {
    pub fn new() -> Self {
        Self
    }
}

fn clamp(
    value: ResourceRequests,
    min: Option<ResourceRequests>,
    max: Option<ResourceRequests>,
) -> ResourceRequests {
    let mut out = value;
    if let Some(min) = min {
        out.cpu_millicores = out.cpu_millicores.max(min.cpu_millicores);
        out.memory_bytes = out.memory_bytes.max(min.memory_bytes);
    }
    if let Some(max) = max {
        // Zero in a max bound means the dimension is not capped
        if max.cpu_millicores > 0 {
            out.cpu_millicores = out.cpu_millicores.min(max.cpu_millicores);
        }
        if max.memory_bytes > 0 {
            out.memory_bytes = out.memory_bytes.min(max.memory_bytes);
        }
    }
    out
}

impl RecommendationProcessor for CappingRecommendationProcessor {
    fn apply(&self, vpa: &Vpa, pod: &Pod) -> anyhow::Result<Option<RecommendedPodResources>> {
        if vpa.recommendation.is_empty() {
            return Ok(None);
        }

        let mut resources = RecommendedPodResources::default();
        let mut changed = false;

        for container in &pod.containers {
            let Some(recommendation) = vpa.recommendation_for(&container.name) else {
                continue;
            };
            let policy = vpa.policy_for(&container.name);
            let target = clamp(
                recommendation.target,
                policy.and_then(|p| p.min_allowed),
                policy.and_then(|p| p.max_allowed),
            );

            if target != container.requests {
                changed = true;
            }
            resources.containers.insert(container.name.clone(), target);
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(resources))
    }
}
