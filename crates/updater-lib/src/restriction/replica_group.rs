//! Restriction providers that protect replica groups
//!
//! Pods are grouped by their controller. A group tolerates disruption of at
//! most `max(1, floor(running * eviction_tolerance))` pods per workload pass,
//! and only while it has at least `min_replicas` running pods. Pods that are
//! not running already count as disrupted.

use super::{
    EvictionRestriction, InPlaceDecision, InPlaceRestriction, RestrictionFactory, Restrictions,
};
use crate::events::{reasons, EventSink, EventType};
use crate::models::{ControllerKey, Pod, PodPhase, PodWithTarget, RecommendedPodResources, Vpa};
use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Performs the actual disruption calls against the cluster
#[async_trait]
pub trait PodDisruptor: Send + Sync {
    async fn evict(&self, pod: &Pod) -> anyhow::Result<()>;

    async fn resize(&self, pod: &Pod, target: &RecommendedPodResources) -> anyhow::Result<()>;
}

/// Tuning of the replica group restrictions
#[derive(Debug, Clone)]
pub struct ReplicaGroupConfig {
    /// Minimum running replicas a group needs before any pod is disrupted
    pub min_replicas: usize,
    /// Fraction of running replicas that may be disrupted in one pass
    pub eviction_tolerance: f64,
    /// How long an in-place resize may stay unapplied before the pod is evicted
    pub in_place_deferral_timeout: Duration,
}

impl Default for ReplicaGroupConfig {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            eviction_tolerance: 0.5,
            in_place_deferral_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct InPlaceAttempt {
    vpa: String,
    at: DateTime<Utc>,
}

impl InPlaceAttempt {
    fn older_than(&self, age: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(age)
            .map(|age| now.signed_duration_since(self.at) > age)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupStats {
    running: usize,
    disrupted: usize,
    allowed: usize,
}

impl GroupStats {
    fn can_disrupt(&self, min_replicas: usize) -> bool {
        self.running >= min_replicas && self.disrupted < self.allowed
    }
}

fn vpa_key(vpa: &Vpa) -> String {
    format!("{}/{}", vpa.namespace, vpa.name)
}

/// Builds replica group restrictions; in-place attempt times outlive cycles
pub struct ReplicaGroupRestrictionFactory {
    config: ReplicaGroupConfig,
    disruptor: Arc<dyn PodDisruptor>,
    in_place_attempts: Arc<DashMap<String, InPlaceAttempt>>,
}

impl ReplicaGroupRestrictionFactory {
    pub fn new(config: ReplicaGroupConfig, disruptor: Arc<dyn PodDisruptor>) -> Self {
        Self {
            config,
            disruptor,
            in_place_attempts: Arc::new(DashMap::new()),
        }
    }

    /// Number of pods with a pending in-place attempt
    pub fn pending_in_place(&self) -> usize {
        self.in_place_attempts.len()
    }
}

impl RestrictionFactory for ReplicaGroupRestrictionFactory {
    fn new_restrictions(
        &self,
        vpa: &Vpa,
        live_pods: &[Pod],
        candidates: &[PodWithTarget],
    ) -> anyhow::Result<Restrictions> {
        let key = vpa_key(vpa);

        // Attempts for pods that converged or disappeared are done. Attempts
        // of VPA objects that are no longer processed expire after twice the
        // deferral timeout.
        let still_needed: HashSet<&str> = candidates.iter().map(|c| c.pod.uid.as_str()).collect();
        let expiry = self.config.in_place_deferral_timeout * 2;
        let now = Utc::now();
        self.in_place_attempts.retain(|uid, attempt| {
            if attempt.vpa == key {
                still_needed.contains(uid.as_str())
            } else {
                !attempt.older_than(expiry, now)
            }
        });

        let mut pod_groups = HashMap::new();
        let mut members: HashMap<ControllerKey, (usize, usize)> = HashMap::new();
        for pod in live_pods {
            let Some(owner) = pod.owner.clone() else {
                debug!(
                    pod = %pod.object_ref(),
                    "Pod has no controller, it will not be disrupted"
                );
                continue;
            };
            let entry = members.entry(owner.clone()).or_default();
            entry.0 += 1;
            if pod.phase == PodPhase::Running {
                entry.1 += 1;
            }
            pod_groups.insert(pod.uid.clone(), owner);
        }

        let tolerance = self.config.eviction_tolerance;
        let groups = members
            .into_iter()
            .map(|(owner, (total, running))| {
                let allowed = ((running as f64 * tolerance).floor() as usize).max(1);
                let stats = GroupStats {
                    running,
                    disrupted: total - running,
                    allowed,
                };
                (owner, stats)
            })
            .collect();

        let restriction = Arc::new(GroupRestriction {
            config: self.config.clone(),
            disruptor: self.disruptor.clone(),
            in_place_attempts: self.in_place_attempts.clone(),
            vpa_key: key,
            pod_groups,
            groups: Mutex::new(groups),
        });

        Ok(Restrictions {
            eviction: restriction.clone(),
            in_place: restriction,
        })
    }
}

struct GroupRestriction {
    config: ReplicaGroupConfig,
    disruptor: Arc<dyn PodDisruptor>,
    in_place_attempts: Arc<DashMap<String, InPlaceAttempt>>,
    vpa_key: String,
    pod_groups: HashMap<String, ControllerKey>,
    groups: Mutex<HashMap<ControllerKey, GroupStats>>,
}

impl GroupRestriction {
    fn groups(&self) -> MutexGuard<'_, HashMap<ControllerKey, GroupStats>> {
        match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn group_allows(&self, owner: &ControllerKey) -> bool {
        self.groups()
            .get(owner)
            .map(|stats| stats.can_disrupt(self.config.min_replicas))
            .unwrap_or(false)
    }

    fn record_disruption(&self, pod: &Pod) {
        if pod.phase != PodPhase::Running {
            return;
        }
        if let Some(owner) = self.pod_groups.get(&pod.uid) {
            if let Some(stats) = self.groups().get_mut(owner) {
                stats.disrupted += 1;
            }
        }
    }
}

#[async_trait]
impl EvictionRestriction for GroupRestriction {
    fn can_evict(&self, pod: &Pod) -> bool {
        let Some(owner) = self.pod_groups.get(&pod.uid) else {
            return false;
        };
        if pod.phase == PodPhase::Pending {
            return true;
        }
        self.group_allows(owner)
    }

    async fn evict(&self, pod: &Pod, vpa: &Vpa, events: &dyn EventSink) -> anyhow::Result<()> {
        if !self.can_evict(pod) {
            bail!(
                "cannot evict pod {}: replica group disruption budget exhausted",
                pod.object_ref()
            );
        }

        self.disruptor.evict(pod).await?;

        self.record_disruption(pod);
        self.in_place_attempts.remove(&pod.uid);

        events.event(
            &pod.object_ref(),
            EventType::Normal,
            reasons::EVICTED_BY_VPA,
            "Pod was evicted by VPA Updater to apply resource recommendation.",
        );
        events.event(
            &vpa.object_ref(),
            EventType::Normal,
            reasons::EVICTED_POD,
            &format!(
                "VPA Updater evicted Pod {} to apply resource recommendation.",
                pod.name
            ),
        );
        Ok(())
    }
}

#[async_trait]
impl InPlaceRestriction for GroupRestriction {
    fn can_in_place_update(&self, pod: &Pod) -> InPlaceDecision {
        let Some(owner) = self.pod_groups.get(&pod.uid) else {
            return InPlaceDecision::Deferred;
        };
        if pod.phase != PodPhase::Running {
            return InPlaceDecision::Deferred;
        }

        if let Some(attempt) = self.in_place_attempts.get(&pod.uid) {
            let timed_out = attempt.older_than(self.config.in_place_deferral_timeout, Utc::now());
            return if timed_out {
                InPlaceDecision::Evict
            } else {
                InPlaceDecision::Deferred
            };
        }

        if self.group_allows(owner) {
            InPlaceDecision::Approved
        } else {
            InPlaceDecision::Deferred
        }
    }

    async fn in_place_update(
        &self,
        pod: &Pod,
        target: &RecommendedPodResources,
        vpa: &Vpa,
        events: &dyn EventSink,
    ) -> anyhow::Result<()> {
        self.disruptor.resize(pod, target).await?;

        self.record_disruption(pod);
        self.in_place_attempts.insert(
            pod.uid.clone(),
            InPlaceAttempt {
                vpa: self.vpa_key.clone(),
                at: Utc::now(),
            },
        );

        events.event(
            &pod.object_ref(),
            EventType::Normal,
            reasons::IN_PLACE_RESIZED,
            "Pod was resized in place by VPA Updater.",
        );
        events.event(
            &vpa.object_ref(),
            EventType::Normal,
            reasons::IN_PLACE_RESIZED_POD,
            &format!("VPA Updater resized Pod {} in place.", pod.name),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingEventSink;
    use crate::models::ResourceRequests;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDisruptor {
        evictions: AtomicUsize,
        resizes: AtomicUsize,
        fail_resize: bool,
    }

    #[async_trait]
    impl PodDisruptor for FakeDisruptor {
        async fn evict(&self, _pod: &Pod) -> anyhow::Result<()> {
            self.evictions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resize(
            &self,
            _pod: &Pod,
            _target: &RecommendedPodResources,
        ) -> anyhow::Result<()> {
            self.resizes.fetch_add(1, Ordering::SeqCst);
            if self.fail_resize {
                bail!("resize rejected");
            }
            Ok(())
        }
    }

    fn pods(count: usize) -> Vec<Pod> {
        (0..count)
            .map(|i| {
                Pod::new("default", format!("web-{}", i))
                    .with_owner("ReplicaSet", "web")
                    .with_container("app", ResourceRequests::new(1000, 100))
            })
            .collect()
    }

    fn candidates(pods: &[Pod]) -> Vec<PodWithTarget> {
        pods.iter()
            .map(|pod| PodWithTarget {
                pod: pod.clone(),
                target: RecommendedPodResources::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_eviction_tolerance() {
        let disruptor = Arc::new(FakeDisruptor::default());
        let factory =
            ReplicaGroupRestrictionFactory::new(ReplicaGroupConfig::default(), disruptor.clone());
        let vpa = Vpa::new("default", "web");
        let pods = pods(4);
        let events = RecordingEventSink::default();

        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();

        // 4 running * 0.5 tolerance = 2 disruptions
        let mut evicted = 0;
        for pod in &pods {
            if restrictions.eviction.can_evict(pod) {
                restrictions.eviction.evict(pod, &vpa, &events).await.unwrap();
                evicted += 1;
            }
        }
        assert_eq!(evicted, 2);
        assert_eq!(disruptor.evictions.load(Ordering::SeqCst), 2);
        assert_eq!(
            events.reasons(),
            vec![
                reasons::EVICTED_BY_VPA,
                reasons::EVICTED_POD,
                reasons::EVICTED_BY_VPA,
                reasons::EVICTED_POD
            ]
        );
    }

    #[tokio::test]
    async fn test_below_min_replicas_is_protected() {
        let disruptor = Arc::new(FakeDisruptor::default());
        let factory =
            ReplicaGroupRestrictionFactory::new(ReplicaGroupConfig::default(), disruptor.clone());
        let vpa = Vpa::new("default", "web");
        let pods = pods(1);

        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();

        assert!(!restrictions.eviction.can_evict(&pods[0]));
        assert_eq!(
            restrictions.in_place.can_in_place_update(&pods[0]),
            InPlaceDecision::Deferred
        );
        assert!(restrictions
            .eviction
            .evict(&pods[0], &vpa, &RecordingEventSink::default())
            .await
            .is_err());
        assert_eq!(disruptor.evictions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pods_without_controller_are_untouched() {
        let factory = ReplicaGroupRestrictionFactory::new(
            ReplicaGroupConfig::default(),
            Arc::new(FakeDisruptor::default()),
        );
        let vpa = Vpa::new("default", "web");
        let orphan = Pod::new("default", "orphan");

        let restrictions = factory
            .new_restrictions(&vpa, &[orphan.clone()], &[])
            .unwrap();
        assert!(!restrictions.eviction.can_evict(&orphan));
        assert_eq!(
            restrictions.in_place.can_in_place_update(&orphan),
            InPlaceDecision::Deferred
        );
    }

    #[tokio::test]
    async fn test_pending_resize_is_deferred_then_evicted() {
        let config = ReplicaGroupConfig {
            in_place_deferral_timeout: Duration::from_secs(60),
            ..ReplicaGroupConfig::default()
        };
        let factory =
            ReplicaGroupRestrictionFactory::new(config, Arc::new(FakeDisruptor::default()));
        let vpa = Vpa::new("default", "web");
        let pods = pods(2);
        let events = RecordingEventSink::default();

        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();
        assert_eq!(
            restrictions.in_place.can_in_place_update(&pods[0]),
            InPlaceDecision::Approved
        );
        restrictions
            .in_place
            .in_place_update(&pods[0], &RecommendedPodResources::default(), &vpa, &events)
            .await
            .unwrap();
        assert_eq!(factory.pending_in_place(), 1);

        // Next pass: the resize has not landed yet
        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();
        assert_eq!(
            restrictions.in_place.can_in_place_update(&pods[0]),
            InPlaceDecision::Deferred
        );

        // Pretend the attempt is older than the deferral timeout
        if let Some(mut attempt) = factory.in_place_attempts.get_mut(&pods[0].uid) {
            attempt.at = Utc::now() - chrono::Duration::seconds(120);
        }
        assert_eq!(
            restrictions.in_place.can_in_place_update(&pods[0]),
            InPlaceDecision::Evict
        );
    }

    #[tokio::test]
    async fn test_converged_pods_are_forgotten() {
        let factory = ReplicaGroupRestrictionFactory::new(
            ReplicaGroupConfig::default(),
            Arc::new(FakeDisruptor::default()),
        );
        let vpa = Vpa::new("default", "web");
        let pods = pods(2);

        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();
        restrictions
            .in_place
            .in_place_update(
                &pods[0],
                &RecommendedPodResources::default(),
                &vpa,
                &RecordingEventSink::default(),
            )
            .await
            .unwrap();
        assert_eq!(factory.pending_in_place(), 1);

        // pods[0] is no longer a candidate
        factory
            .new_restrictions(&vpa, &pods, &candidates(&pods[1..]))
            .unwrap();
        assert_eq!(factory.pending_in_place(), 0);
    }

    #[tokio::test]
    async fn test_attempts_of_vanished_vpas_expire() {
        let config = ReplicaGroupConfig {
            in_place_deferral_timeout: Duration::from_secs(60),
            ..ReplicaGroupConfig::default()
        };
        let factory =
            ReplicaGroupRestrictionFactory::new(config, Arc::new(FakeDisruptor::default()));
        let events = RecordingEventSink::default();

        for i in 0..50 {
            let vpa = Vpa::new("default", format!("gone-{}", i));
            let pod = Pod::new("default", format!("gone-{}-0", i)).with_owner("ReplicaSet", "gone");
            let group = vec![
                pod.clone(),
                Pod::new("default", "peer").with_owner("ReplicaSet", "gone"),
            ];
            let restrictions = factory
                .new_restrictions(&vpa, &group, &candidates(&group))
                .unwrap();
            restrictions
                .in_place
                .in_place_update(&pod, &RecommendedPodResources::default(), &vpa, &events)
                .await
                .unwrap();
        }
        assert_eq!(factory.pending_in_place(), 50);

        // Recent attempts of other VPA objects survive an unrelated pass
        let web = Vpa::new("default", "web");
        let pods = pods(2);
        factory
            .new_restrictions(&web, &pods, &candidates(&pods))
            .unwrap();
        assert_eq!(factory.pending_in_place(), 50);

        for mut attempt in factory.in_place_attempts.iter_mut() {
            attempt.at = Utc::now() - chrono::Duration::seconds(121);
        }
        factory
            .new_restrictions(&web, &pods, &candidates(&pods))
            .unwrap();
        assert_eq!(factory.pending_in_place(), 0);
    }

    #[tokio::test]
    async fn test_failed_resize_is_not_recorded() {
        let disruptor = Arc::new(FakeDisruptor {
            fail_resize: true,
            ..FakeDisruptor::default()
        });
        let factory =
            ReplicaGroupRestrictionFactory::new(ReplicaGroupConfig::default(), disruptor.clone());
        let vpa = Vpa::new("default", "web");
        let pods = pods(2);
        let events = RecordingEventSink::default();

        let restrictions = factory
            .new_restrictions(&vpa, &pods, &candidates(&pods))
            .unwrap();
        let result = restrictions
            .in_place
            .in_place_update(&pods[0], &RecommendedPodResources::default(), &vpa, &events)
            .await;

        assert!(result.is_err());
        assert_eq!(disruptor.resizes.load(Ordering::SeqCst), 1);
        assert_eq!(factory.pending_in_place(), 0);
        assert!(events.reasons().is_empty());
        // The failed resize did not consume the group budget
        assert!(restrictions.eviction.can_evict(&pods[0]));
    }
}
