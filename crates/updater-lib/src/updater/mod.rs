//! The updater reconciliation loop
//!
//! Once per cycle the updater lists VPA objects and live pods, picks the pods
//! whose requests should change and disrupts them, either by an in-place
//! resize or by eviction, under two shared rate limits.

mod cycle;
mod r#loop;

#[cfg(test)]
pub(crate) mod testing;

pub use r#loop::UpdaterLoop;

use crate::config::UpdaterConfig;
use crate::events::{EventSink, TracingEventSink};
use crate::models::{Pod, UpdateMode, Vpa};
use crate::observability::{StructuredLogger, UpdaterMetrics};
use crate::priority::{DefaultPriorityProcessor, PriorityProcessor};
use crate::ratelimit::{new_rate_limiter, RateLimiter};
use crate::recommendation::{CappingRecommendationProcessor, RecommendationProcessor};
use crate::restriction::RestrictionFactory;
use crate::status::StatusValidator;
use crate::target::{ControllerFetcher, SelectorFetcher};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Lists all VPA objects
#[async_trait]
pub trait VpaLister: Send + Sync {
    async fn list(&self) -> Result<Vec<Vpa>>;
}

/// Lists all pods in the cluster
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list(&self) -> Result<Vec<Pod>>;
}

/// What happened to the pods of one workload during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadOutcome {
    /// `namespace/name` of the VPA object
    pub workload: String,
    pub update_mode: UpdateMode,
    /// Live pods matched to the workload
    pub controlled_pods: usize,
    pub evicted: usize,
    pub eviction_failed: usize,
    pub in_place_updated: usize,
    pub in_place_failed: usize,
    pub deferred: usize,
    /// Candidates left alone because of rate limits or eviction restrictions
    pub skipped: usize,
}

impl WorkloadOutcome {
    pub fn new(workload: impl Into<String>, update_mode: UpdateMode) -> Self {
        Self {
            workload: workload.into(),
            update_mode,
            controlled_pods: 0,
            evicted: 0,
            eviction_failed: 0,
            in_place_updated: 0,
            in_place_failed: 0,
            deferred: 0,
            skipped: 0,
        }
    }
}

/// Per-workload results of one cycle, in processing order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub workloads: Vec<WorkloadOutcome>,
}

impl CycleOutcome {
    pub fn total_evicted(&self) -> usize {
        self.workloads.iter().map(|w| w.evicted).sum()
    }

    pub fn total_in_place_updated(&self) -> usize {
        self.workloads.iter().map(|w| w.in_place_updated).sum()
    }

    pub fn workload(&self, name: &str) -> Option<&WorkloadOutcome> {
        self.workloads.iter().find(|w| w.workload == name)
    }
}

/// The reconciliation control loop
pub struct Updater {
    vpa_lister: Arc<dyn VpaLister>,
    pod_lister: Arc<dyn PodLister>,
    selector_fetcher: Arc<dyn SelectorFetcher>,
    controller_fetcher: Option<Arc<dyn ControllerFetcher>>,
    status_validator: Option<Arc<dyn StatusValidator>>,
    recommendation_processor: Arc<dyn RecommendationProcessor>,
    priority_processor: Arc<dyn PriorityProcessor>,
    restriction_factory: Arc<dyn RestrictionFactory>,
    event_sink: Arc<dyn EventSink>,
    eviction_rate_limiter: Arc<RateLimiter>,
    in_place_rate_limiter: Arc<RateLimiter>,
    config: UpdaterConfig,
    metrics: UpdaterMetrics,
    logger: StructuredLogger,
    status_gate_open: AtomicBool,
}

impl Updater {
    pub fn builder() -> UpdaterBuilder {
        UpdaterBuilder::new()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn eviction_rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.eviction_rate_limiter
    }

    pub fn in_place_rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.in_place_rate_limiter
    }
}

/// Builder for [`Updater`]
pub struct UpdaterBuilder {
    vpa_lister: Option<Arc<dyn VpaLister>>,
    pod_lister: Option<Arc<dyn PodLister>>,
    selector_fetcher: Option<Arc<dyn SelectorFetcher>>,
    controller_fetcher: Option<Arc<dyn ControllerFetcher>>,
    status_validator: Option<Arc<dyn StatusValidator>>,
    recommendation_processor: Option<Arc<dyn RecommendationProcessor>>,
    priority_processor: Option<Arc<dyn PriorityProcessor>>,
    restriction_factory: Option<Arc<dyn RestrictionFactory>>,
    event_sink: Option<Arc<dyn EventSink>>,
    rate_limiters: Option<(Arc<RateLimiter>, Arc<RateLimiter>)>,
    config: UpdaterConfig,
}

impl UpdaterBuilder {
    pub fn new() -> Self {
        Self {
            vpa_lister: None,
            pod_lister: None,
            selector_fetcher: None,
            controller_fetcher: None,
            status_validator: None,
            recommendation_processor: None,
            priority_processor: None,
            restriction_factory: None,
            event_sink: None,
            rate_limiters: None,
            config: UpdaterConfig::default(),
        }
    }

    pub fn config(mut self, config: UpdaterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn vpa_lister(mut self, lister: Arc<dyn VpaLister>) -> Self {
        self.vpa_lister = Some(lister);
        self
    }

    pub fn pod_lister(mut self, lister: Arc<dyn PodLister>) -> Self {
        self.pod_lister = Some(lister);
        self
    }

    pub fn selector_fetcher(mut self, fetcher: Arc<dyn SelectorFetcher>) -> Self {
        self.selector_fetcher = Some(fetcher);
        self
    }

    pub fn controller_fetcher(mut self, fetcher: Arc<dyn ControllerFetcher>) -> Self {
        self.controller_fetcher = Some(fetcher);
        self
    }

    pub fn status_validator(mut self, validator: Arc<dyn StatusValidator>) -> Self {
        self.status_validator = Some(validator);
        self
    }

    pub fn recommendation_processor(mut self, processor: Arc<dyn RecommendationProcessor>) -> Self {
        self.recommendation_processor = Some(processor);
        self
    }

    pub fn priority_processor(mut self, processor: Arc<dyn PriorityProcessor>) -> Self {
        self.priority_processor = Some(processor);
        self
    }

    pub fn restriction_factory(mut self, factory: Arc<dyn RestrictionFactory>) -> Self {
        self.restriction_factory = Some(factory);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Use existing limiters instead of building them from the config
    pub fn rate_limiters(mut self, eviction: Arc<RateLimiter>, in_place: Arc<RateLimiter>) -> Self {
        self.rate_limiters = Some((eviction, in_place));
        self
    }

    pub fn build(self) -> Result<Updater> {
        let vpa_lister = self
            .vpa_lister
            .ok_or_else(|| anyhow::anyhow!("VPA lister is required"))?;
        let pod_lister = self
            .pod_lister
            .ok_or_else(|| anyhow::anyhow!("Pod lister is required"))?;
        let selector_fetcher = self
            .selector_fetcher
            .ok_or_else(|| anyhow::anyhow!("Selector fetcher is required"))?;
        let restriction_factory = self
            .restriction_factory
            .ok_or_else(|| anyhow::anyhow!("Restriction factory is required"))?;
        if self.config.use_admission_controller_status && self.status_validator.is_none() {
            anyhow::bail!(
                "Status validator is required when the admission controller status is used"
            );
        }

        let (eviction_rate_limiter, in_place_rate_limiter) =
            self.rate_limiters.unwrap_or_else(|| {
                (
                    Arc::new(new_rate_limiter(
                        self.config.eviction_rate_limit,
                        self.config.eviction_rate_burst,
                    )),
                    Arc::new(new_rate_limiter(
                        self.config.in_place_rate_limit,
                        self.config.in_place_rate_burst,
                    )),
                )
            });

        Ok(Updater {
            vpa_lister,
            pod_lister,
            selector_fetcher,
            controller_fetcher: self.controller_fetcher,
            status_validator: self.status_validator,
            recommendation_processor: self
                .recommendation_processor
                .unwrap_or_else(|| Arc::new(CappingRecommendationProcessor::new())),
            priority_processor: self
                .priority_processor
                .unwrap_or_else(|| Arc::new(DefaultPriorityProcessor::default())),
            restriction_factory,
            event_sink: self
                .event_sink
                .unwrap_or_else(|| Arc::new(TracingEventSink::default())),
            eviction_rate_limiter,
            in_place_rate_limiter,
            config: self.config,
            metrics: UpdaterMetrics::new(),
            logger: StructuredLogger::new("vpa-updater"),
            status_gate_open: AtomicBool::new(true),
        })
    }
}

impl Default for UpdaterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
