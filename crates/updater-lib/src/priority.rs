//! Update priority of pods within a workload
//!
//! Decides which pods still need a disruption and in what order. The control
//! loop processes the returned list exactly in this order.

use crate::models::{PodWithTarget, ResourceRequests, Vpa};
use chrono::Utc;
use std::cmp::Ordering;
use std::time::Duration;

/// Default minimum summed relative change that justifies a disruption
pub const DEFAULT_MIN_CHANGE_FRACTION: f64 = 0.1;

/// Default minimum pod age before an in-range change is applied
pub const DEFAULT_MIN_POD_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

/// Orders the pods of a workload by descending update urgency
pub trait PriorityProcessor: Send + Sync {
    fn get_ordered_candidates(&self, vpa: &Vpa, pods: Vec<PodWithTarget>) -> Vec<PodWithTarget>;
}

/// Urgency of a single pod update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdatePriority {
    /// Some container is outside the recommended [lower, upper] range
    pub outside_recommended_range: bool,
    /// Summed relative change of total cpu and memory requests
    pub resource_diff: f64,
}

impl UpdatePriority {
    fn cmp_urgency(&self, other: &Self) -> Ordering {
        other
            .outside_recommended_range
            .cmp(&self.outside_recommended_range)
            .then_with(|| {
                other
                    .resource_diff
                    .partial_cmp(&self.resource_diff)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

/// Priority processor based on relative resource change and recommendation bounds
#[derive(Debug, Clone)]
pub struct DefaultPriorityProcessor {
    min_change_fraction: f64,
    min_pod_lifetime: Duration,
}

impl Default for DefaultPriorityProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CHANGE_FRACTION, DEFAULT_MIN_POD_LIFETIME)
    }
}

fn relative_diff(current: u64, target: u64) -> f64 {
    if current == 0 {
        return if target == 0 { 0.0 } else { 1.0 };
    }
    (target as f64 - current as f64).abs() / current as f64
}

fn outside(
    current: ResourceRequests,
    lower: Option<ResourceRequests>,
    upper: Option<ResourceRequests>,
) -> bool {
    let below = lower
        .map(|l| current.cpu_millicores < l.cpu_millicores || current.memory_bytes < l.memory_bytes)
        .unwrap_or(false);
    let above = upper
        .map(|u| {
            (u.cpu_millicores > 0 && current.cpu_millicores > u.cpu_millicores)
                || (u.memory_bytes > 0 && current.memory_bytes > u.memory_bytes)
        })
        .unwrap_or(false);
    below || above
}

impl DefaultPriorityProcessor {
    pub fn new(min_change_fraction: f64, min_pod_lifetime: Duration) -> Self {
        Self {
            min_change_fraction,
            min_pod_lifetime,
        }
    }

    pub fn priority(&self, vpa: &Vpa, candidate: &PodWithTarget) -> UpdatePriority {
        let mut current_total = ResourceRequests::default();
        let mut target_total = ResourceRequests::default();
        let mut outside_recommended_range = false;

        for container in &candidate.pod.containers {
            let Some(target) = candidate.target.containers.get(&container.name) else {
                continue;
            };
            current_total.cpu_millicores += container.requests.cpu_millicores;
            current_total.memory_bytes += container.requests.memory_bytes;
            target_total.cpu_millicores += target.cpu_millicores;
            target_total.memory_bytes += target.memory_bytes;

            if let Some(rec) = vpa.recommendation_for(&container.name) {
                if outside(container.requests, rec.lower_bound, rec.upper_bound) {
                    outside_recommended_range = true;
                }
            }
        }

        UpdatePriority {
            outside_recommended_range,
            resource_diff: relative_diff(current_total.cpu_millicores, target_total.cpu_millicores)
                + relative_diff(current_total.memory_bytes, target_total.memory_bytes),
        }
    }

    fn lived_long_enough(&self, candidate: &PodWithTarget) -> bool {
        let Some(created) = candidate.pod.creation_timestamp else {
            return true;
        };
        let Ok(min_lifetime) = chrono::Duration::from_std(self.min_pod_lifetime) else {
            return false;
        };
        Utc::now().signed_duration_since(created) >= min_lifetime
    }
}

impl PriorityProcessor for DefaultPriorityProcessor {
    fn get_ordered_candidates(&self, vpa: &Vpa, pods: Vec<PodWithTarget>) -> Vec<PodWithTarget> {
        let mut scored: Vec<(UpdatePriority, PodWithTarget)> = pods
            .into_iter()
            .map(|candidate| (self.priority(vpa, &candidate), candidate))
            .filter(|(priority, candidate)| {
                priority.outside_recommended_range
                    || (priority.resource_diff >= self.min_change_fraction
                        && self.lived_long_enough(candidate))
            })
            .collect();

        // Stable, so equal priorities keep lister order
        scored.sort_by(|(a, _), (b, _)| a.cmp_urgency(b));
        scored.into_iter().map(|(_, candidate)| candidate).collect()
    }
}
