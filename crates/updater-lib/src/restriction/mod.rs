//! Per-pod disruption restrictions
//!
//! A restriction provider answers whether a pod may be disrupted by a given
//! mechanism and performs the disruption. The control loop only talks to
//! these traits, so policy engines can be swapped without touching it.

mod replica_group;

pub use replica_group::{PodDisruptor, ReplicaGroupConfig, ReplicaGroupRestrictionFactory};

use crate::events::EventSink;
use crate::models::{Pod, PodWithTarget, RecommendedPodResources, Vpa};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Outcome of the in-place eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPlaceDecision {
    /// Resize the pod in place
    Approved,
    /// Do nothing to this pod this cycle
    Deferred,
    /// Skip the resize and evict instead
    Evict,
}

impl fmt::Display for InPlaceDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InPlaceDecision::Approved => f.write_str("approved"),
            InPlaceDecision::Deferred => f.write_str("deferred"),
            InPlaceDecision::Evict => f.write_str("evict"),
        }
    }
}

/// Eligibility check and action for evictions
#[async_trait]
pub trait EvictionRestriction: Send + Sync {
    fn can_evict(&self, pod: &Pod) -> bool;

    async fn evict(&self, pod: &Pod, vpa: &Vpa, events: &dyn EventSink) -> anyhow::Result<()>;
}

/// Eligibility check and action for in-place resizes
#[async_trait]
pub trait InPlaceRestriction: Send + Sync {
    fn can_in_place_update(&self, pod: &Pod) -> InPlaceDecision;

    async fn in_place_update(
        &self,
        pod: &Pod,
        target: &RecommendedPodResources,
        vpa: &Vpa,
        events: &dyn EventSink,
    ) -> anyhow::Result<()>;
}

/// The pair of providers used for one workload
#[derive(Clone)]
pub struct Restrictions {
    pub eviction: Arc<dyn EvictionRestriction>,
    pub in_place: Arc<dyn InPlaceRestriction>,
}

/// Builds the restriction providers for a workload from its live pods
pub trait RestrictionFactory: Send + Sync {
    fn new_restrictions(
        &self,
        vpa: &Vpa,
        live_pods: &[Pod],
        candidates: &[PodWithTarget],
    ) -> anyhow::Result<Restrictions>;
}
