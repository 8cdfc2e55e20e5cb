//! Test doubles for the updater collaborators

use super::{PodLister, Updater, UpdaterBuilder, VpaLister};
use crate::config::UpdaterConfig;
use crate::events::EventSink;
use crate::models::{
    ContainerResourcePolicy, Pod, PodWithTarget, RecommendedPodResources, ResourceRequests,
    UpdateMode, Vpa,
};
use crate::restriction::{
    EvictionRestriction, InPlaceDecision, InPlaceRestriction, RestrictionFactory, Restrictions,
};
use crate::selector::LabelSelector;
use crate::status::StatusValidator;
use crate::target::SelectorFetcher;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const CONTAINER: &str = "container1";

/// Ordered record of disruptive calls, e.g. `evict:test_0`
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn test_vpa(namespace: &str, name: &str, mode: UpdateMode) -> Vpa {
    Vpa::new(namespace, name)
        .with_update_mode(mode)
        .with_target_ref("ReplicationController", "rc")
        .with_recommendation(CONTAINER, ResourceRequests::new(2000, 200_000_000))
        .with_policy(ContainerResourcePolicy {
            container_name: CONTAINER.to_string(),
            min_allowed: Some(ResourceRequests::new(1000, 100_000_000)),
            max_allowed: Some(ResourceRequests::new(3000, 1_000_000_000)),
        })
}

pub fn test_pods(namespace: &str, prefix: &str, count: usize) -> Vec<Pod> {
    (0..count)
        .map(|i| {
            Pod::new(namespace, format!("{}_{}", prefix, i))
                .with_label("app", "testingApp")
                .with_owner("ReplicationController", "rc")
                .with_container(CONTAINER, ResourceRequests::new(1000, 100_000_000))
        })
        .collect()
}

#[derive(Default)]
pub struct FakeVpaLister {
    vpas: Mutex<Vec<Vpa>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeVpaLister {
    pub fn set(&self, vpas: Vec<Vpa>) {
        *self.vpas.lock().unwrap() = vpas;
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VpaLister for FakeVpaLister {
    async fn list(&self) -> Result<Vec<Vpa>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("vpa list failed");
        }
        Ok(self.vpas.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakePodLister {
    pods: Mutex<Vec<Pod>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakePodLister {
    pub fn set(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodLister for FakePodLister {
    async fn list(&self) -> Result<Vec<Pod>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("pod list failed");
        }
        Ok(self.pods.lock().unwrap().clone())
    }
}

/// Resolves every VPA to the same selector, except those marked failing
pub struct FakeSelectorFetcher {
    selector: LabelSelector,
    failing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeSelectorFetcher {
    pub fn new(selector: LabelSelector) -> Self {
        Self {
            selector,
            failing: Mutex::new(HashSet::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for(&self, vpa_name: &str) {
        self.failing.lock().unwrap().insert(vpa_name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl SelectorFetcher for FakeSelectorFetcher {
    async fn fetch(&self, vpa: &Vpa) -> Result<LabelSelector> {
        self.fetched.lock().unwrap().push(vpa.name.clone());
        if self.failing.lock().unwrap().contains(&vpa.name) {
            return Err(anyhow!("no target for {}", vpa.name));
        }
        Ok(self.selector.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBehavior {
    Valid,
    Invalid,
    Error,
    Hang,
}

pub struct FakeStatusValidator {
    behavior: Mutex<StatusBehavior>,
    calls: AtomicUsize,
}

impl FakeStatusValidator {
    pub fn new(behavior: StatusBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_valid(&self, valid: bool) {
        self.set_behavior(if valid {
            StatusBehavior::Valid
        } else {
            StatusBehavior::Invalid
        });
    }

    pub fn set_behavior(&self, behavior: StatusBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusValidator for FakeStatusValidator {
    async fn is_status_valid(&self, _timeout: Duration) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            StatusBehavior::Valid => Ok(true),
            StatusBehavior::Invalid => Ok(false),
            StatusBehavior::Error => bail!("lease not found"),
            StatusBehavior::Hang => std::future::pending().await,
        }
    }
}

pub struct MockEviction {
    can_evict: AtomicBool,
    fail: AtomicBool,
    can_evict_calls: AtomicUsize,
    evict_calls: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    log: CallLog,
}

impl MockEviction {
    pub fn new(log: CallLog) -> Self {
        Self {
            can_evict: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            can_evict_calls: AtomicUsize::new(0),
            evict_calls: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
            log,
        }
    }

    /// Cancel `token` once the `evictions`-th eviction went through
    pub fn cancel_after(&self, evictions: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((evictions, token));
    }

    pub fn set_can_evict(&self, can_evict: bool) {
        self.can_evict.store(can_evict, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn can_evict_calls(&self) -> usize {
        self.can_evict_calls.load(Ordering::SeqCst)
    }

    pub fn evict_calls(&self) -> usize {
        self.evict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvictionRestriction for MockEviction {
    fn can_evict(&self, _pod: &Pod) -> bool {
        self.can_evict_calls.fetch_add(1, Ordering::SeqCst);
        self.can_evict.load(Ordering::SeqCst)
    }

    async fn evict(&self, pod: &Pod, _vpa: &Vpa, _events: &dyn EventSink) -> Result<()> {
        let calls = self.evict_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().unwrap().push(format!("evict:{}", pod.name));
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if calls == *after {
                token.cancel();
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("eviction failed");
        }
        Ok(())
    }
}

pub struct MockInPlace {
    decision: Mutex<InPlaceDecision>,
    fail: AtomicBool,
    decision_calls: AtomicUsize,
    update_calls: AtomicUsize,
    log: CallLog,
}

impl MockInPlace {
    pub fn new(log: CallLog) -> Self {
        Self {
            decision: Mutex::new(InPlaceDecision::Approved),
            fail: AtomicBool::new(false),
            decision_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            log,
        }
    }

    pub fn set_decision(&self, decision: InPlaceDecision) {
        *self.decision.lock().unwrap() = decision;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn decision_calls(&self) -> usize {
        self.decision_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InPlaceRestriction for MockInPlace {
    fn can_in_place_update(&self, _pod: &Pod) -> InPlaceDecision {
        self.decision_calls.fetch_add(1, Ordering::SeqCst);
        *self.decision.lock().unwrap()
    }

    async fn in_place_update(
        &self,
        pod: &Pod,
        _target: &RecommendedPodResources,
        _vpa: &Vpa,
        _events: &dyn EventSink,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("in_place:{}", pod.name));
        if self.fail.load(Ordering::SeqCst) {
            bail!("in-place update failed");
        }
        Ok(())
    }
}

/// Hands out the same mocks for every workload
pub struct FakeRestrictionFactory {
    pub eviction: Arc<MockEviction>,
    pub in_place: Arc<MockInPlace>,
    calls: AtomicUsize,
}

impl FakeRestrictionFactory {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RestrictionFactory for FakeRestrictionFactory {
    fn new_restrictions(
        &self,
        _vpa: &Vpa,
        _live_pods: &[Pod],
        _candidates: &[PodWithTarget],
    ) -> Result<Restrictions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Restrictions {
            eviction: self.eviction.clone(),
            in_place: self.in_place.clone(),
        })
    }
}

/// One VPA over five matching pods, all collaborators faked
pub struct Harness {
    pub vpa_lister: Arc<FakeVpaLister>,
    pub pod_lister: Arc<FakePodLister>,
    pub selector: Arc<FakeSelectorFetcher>,
    pub status: Arc<FakeStatusValidator>,
    pub eviction: Arc<MockEviction>,
    pub in_place: Arc<MockInPlace>,
    pub factory: Arc<FakeRestrictionFactory>,
    pub log: CallLog,
    pub config: UpdaterConfig,
}

impl Harness {
    pub fn new(mode: UpdateMode) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let eviction = Arc::new(MockEviction::new(log.clone()));
        let in_place = Arc::new(MockInPlace::new(log.clone()));
        let factory = Arc::new(FakeRestrictionFactory {
            eviction: eviction.clone(),
            in_place: in_place.clone(),
            calls: AtomicUsize::new(0),
        });

        let vpa_lister = Arc::new(FakeVpaLister::default());
        vpa_lister.set(vec![test_vpa("default", "vpa", mode)]);
        let pod_lister = Arc::new(FakePodLister::default());
        pod_lister.set(test_pods("default", "test", 5));

        Self {
            vpa_lister,
            pod_lister,
            selector: Arc::new(FakeSelectorFetcher::new(LabelSelector::from_labels([(
                "app",
                "testingApp",
            )]))),
            status: Arc::new(FakeStatusValidator::new(StatusBehavior::Valid)),
            eviction,
            in_place,
            factory,
            log,
            config: UpdaterConfig {
                in_place_or_recreate_enabled: true,
                ..UpdaterConfig::default()
            },
        }
    }

    pub fn builder(&self) -> UpdaterBuilder {
        Updater::builder()
            .config(self.config.clone())
            .vpa_lister(self.vpa_lister.clone())
            .pod_lister(self.pod_lister.clone())
            .selector_fetcher(self.selector.clone())
            .status_validator(self.status.clone())
            .restriction_factory(self.factory.clone())
    }

    pub fn updater(&self) -> Updater {
        self.builder().build().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}
