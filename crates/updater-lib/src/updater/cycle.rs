//! One reconciliation pass
//!
//! Ordering matters here: workloads are processed in lister order and the
//! candidates of a workload in priority order, so that the most urgent pods
//! get first claim on the shared rate limits.

use super::{CycleOutcome, Updater, WorkloadOutcome};
use crate::error::{Result, UpdaterError};
use crate::models::{Pod, PodWithTarget, UpdateMode, Vpa};
use crate::restriction::{InPlaceDecision, Restrictions};
use crate::target::is_controlled_by;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run `fut` unless the cycle is cancelled first
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpdaterError::cancelled()),
        out = fut => Ok(out),
    }
}

/// An active VPA object with the live pods its selector and target match
struct Workload<'a> {
    vpa: &'a Vpa,
    mode: UpdateMode,
    pods: Vec<Pod>,
}

/// Index of the workload that controls each pod, keyed by pod uid
///
/// A pod matched by several VPA objects belongs to the oldest one. An object
/// without a creation timestamp counts as oldest and ties go to the one listed
/// first.
fn controlling_workloads(workloads: &[Workload<'_>]) -> HashMap<String, usize> {
    let mut owners: HashMap<String, usize> = HashMap::new();
    for (index, workload) in workloads.iter().enumerate() {
        for pod in &workload.pods {
            owners
                .entry(pod.uid.clone())
                .and_modify(|current| {
                    let held_by = workloads[*current].vpa;
                    if workload.vpa.creation_timestamp < held_by.creation_timestamp {
                        *current = index;
                    }
                })
                .or_insert(index);
        }
    }
    owners
}

impl Updater {
    /// Run a single reconciliation cycle
    ///
    /// Only whole-cycle failures are returned. Failures scoped to a workload
    /// or a pod are logged and skipped. A cancelled cycle returns what it did
    /// so far in [`UpdaterError::Cancelled`].
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        match self.reconcile(cancel, &mut outcome).await {
            Ok(()) => Ok(outcome),
            Err(UpdaterError::Cancelled { .. }) => {
                Err(UpdaterError::Cancelled { partial: outcome })
            }
            Err(e) => Err(e),
        }
    }

    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        outcome: &mut CycleOutcome,
    ) -> Result<()> {
        let vpas = cancellable(cancel, self.vpa_lister.list())
            .await?
            .map_err(UpdaterError::ListWorkloads)?;

        if vpas.is_empty() {
            info!("No VPA objects to process");
            return Ok(());
        }

        if !self.check_status_gate(cancel).await? {
            return Ok(());
        }

        let active: Vec<(&Vpa, UpdateMode)> = vpas
            .iter()
            .filter_map(|vpa| self.active_mode(vpa).map(|mode| (vpa, mode)))
            .collect();

        if active.is_empty() {
            info!(total = vpas.len(), "No active VPA objects");
            return Ok(());
        }

        let pods = cancellable(cancel, self.pod_lister.list())
            .await?
            .map_err(UpdaterError::ListPods)?;
        let live_pods: Vec<Pod> = pods.into_iter().filter(|p| !p.is_terminating()).collect();

        let mut workloads = Vec::with_capacity(active.len());
        for (vpa, mode) in active {
            if let Some(pods) = self.matching_pods(vpa, &live_pods, cancel).await? {
                workloads.push(Workload { vpa, mode, pods });
            }
        }

        let owners = controlling_workloads(&workloads);
        for (index, workload) in workloads.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(UpdaterError::cancelled());
            }

            let matched = workload.pods.len();
            let controlled: Vec<Pod> = workload
                .pods
                .into_iter()
                .filter(|pod| owners.get(&pod.uid) == Some(&index))
                .collect();
            if controlled.len() < matched {
                debug!(
                    workload = %workload.vpa.object_ref(),
                    pods = matched - controlled.len(),
                    "Pods are controlled by an older VPA object"
                );
            }

            self.process_workload(workload.vpa, workload.mode, controlled, cancel, outcome)
                .await?;
        }

        Ok(())
    }

    /// Whether the last evaluated status gate was open
    pub fn status_gate_open(&self) -> bool {
        self.status_gate_open.load(Ordering::Relaxed)
    }

    async fn check_status_gate(&self, cancel: &CancellationToken) -> Result<bool> {
        if !self.config.use_admission_controller_status {
            return Ok(true);
        }
        let Some(validator) = self.status_validator.as_ref() else {
            return Ok(true);
        };

        let timeout = self.config.status_check_timeout();
        let check = tokio::time::timeout(timeout, validator.is_status_valid(timeout));

        let open = match cancellable(cancel, check).await? {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                self.logger
                    .log_status_gate_closed("admission controller status is not fresh");
                false
            }
            Ok(Err(e)) => {
                self.logger
                    .log_status_gate_closed(&format!("status check failed: {}", e));
                false
            }
            Err(_) => {
                self.logger.log_status_gate_closed("status check timed out");
                false
            }
        };

        self.status_gate_open.store(open, Ordering::Relaxed);
        self.metrics.set_status_gate_open(open);
        Ok(open)
    }

    /// Effective mode of a VPA the loop should act on, or `None` to skip it
    fn active_mode(&self, vpa: &Vpa) -> Option<UpdateMode> {
        if self.config.is_namespace_ignored(&vpa.namespace) {
            debug!(
                workload = %vpa.object_ref(),
                namespace = %vpa.namespace,
                "Skipping VPA object in ignored namespace"
            );
            return None;
        }

        match vpa.update_mode() {
            UpdateMode::Off | UpdateMode::Initial => {
                debug!(
                    workload = %vpa.object_ref(),
                    mode = %vpa.update_mode(),
                    "Skipping VPA object because its mode is not Auto or InPlaceOrRecreate"
                );
                None
            }
            UpdateMode::InPlaceOrRecreate if !self.config.in_place_or_recreate_enabled => {
                info!(
                    workload = %vpa.object_ref(),
                    "InPlaceOrRecreate is not enabled, falling back to eviction"
                );
                Some(UpdateMode::Auto)
            }
            mode => Some(mode),
        }
    }

    async fn matching_pods(
        &self,
        vpa: &Vpa,
        live_pods: &[Pod],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Pod>>> {
        let selector = match cancellable(cancel, self.selector_fetcher.fetch(vpa)).await? {
            Ok(selector) => selector,
            Err(e) => {
                warn!(
                    workload = %vpa.object_ref(),
                    error = %e,
                    "Skipping VPA object because its selector cannot be fetched"
                );
                return Ok(None);
            }
        };

        let mut matched = Vec::new();
        for pod in live_pods
            .iter()
            .filter(|p| p.namespace == vpa.namespace && selector.matches(&p.labels))
        {
            if let Some(fetcher) = self.controller_fetcher.as_ref() {
                match cancellable(cancel, is_controlled_by(fetcher.as_ref(), vpa, pod)).await? {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            workload = %vpa.object_ref(),
                            pod = %pod.object_ref(),
                            error = %e,
                            "Cannot resolve the controller of pod"
                        );
                        continue;
                    }
                }
            }
            matched.push(pod.clone());
        }

        Ok(Some(matched))
    }

    /// Disrupt the candidates among `controlled`; the workload's outcome is
    /// added to `cycle` even when cancelled halfway
    async fn process_workload(
        &self,
        vpa: &Vpa,
        mode: UpdateMode,
        controlled: Vec<Pod>,
        cancel: &CancellationToken,
        cycle: &mut CycleOutcome,
    ) -> Result<()> {
        let mut outcome = WorkloadOutcome::new(vpa.object_ref().to_string(), mode);
        outcome.controlled_pods = controlled.len();

        let mut with_targets = Vec::new();
        for pod in &controlled {
            match self.recommendation_processor.apply(vpa, pod) {
                Ok(Some(target)) => with_targets.push(PodWithTarget {
                    pod: pod.clone(),
                    target,
                }),
                Ok(None) => {}
                Err(e) => warn!(
                    workload = %vpa.object_ref(),
                    pod = %pod.object_ref(),
                    error = %e,
                    "Cannot compute recommended resources for pod"
                ),
            }
        }

        let candidates = self
            .priority_processor
            .get_ordered_candidates(vpa, with_targets);

        let restrictions = match self
            .restriction_factory
            .new_restrictions(vpa, &controlled, &candidates)
        {
            Ok(restrictions) => restrictions,
            Err(e) => {
                warn!(
                    workload = %vpa.object_ref(),
                    error = %e,
                    "Cannot build disruption restrictions, skipping VPA object"
                );
                cycle.workloads.push(outcome);
                return Ok(());
            }
        };

        let mut result = Ok(());
        for candidate in &candidates {
            if cancel.is_cancelled() {
                result = Err(UpdaterError::cancelled());
                break;
            }
            if let Err(e) = self
                .disrupt(vpa, mode, candidate, &restrictions, &mut outcome, cancel)
                .await
            {
                result = Err(e);
                break;
            }
        }

        cycle.workloads.push(outcome);
        result
    }

    /// Apply at most one disruption to a candidate pod
    async fn disrupt(
        &self,
        vpa: &Vpa,
        mode: UpdateMode,
        candidate: &PodWithTarget,
        restrictions: &Restrictions,
        outcome: &mut WorkloadOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pod = &candidate.pod;

        if mode == UpdateMode::InPlaceOrRecreate {
            if !self.in_place_rate_limiter.try_acquire() {
                debug!(pod = %pod.object_ref(), "In-place rate limit reached");
                outcome.skipped += 1;
                return Ok(());
            }

            match restrictions.in_place.can_in_place_update(pod) {
                InPlaceDecision::Deferred => {
                    debug!(pod = %pod.object_ref(), "In-place update deferred");
                    outcome.deferred += 1;
                    return Ok(());
                }
                InPlaceDecision::Evict => {
                    debug!(
                        pod = %pod.object_ref(),
                        "In-place update not possible, evicting instead"
                    );
                }
                InPlaceDecision::Approved => {
                    let update = restrictions.in_place.in_place_update(
                        pod,
                        &candidate.target,
                        vpa,
                        self.event_sink.as_ref(),
                    );
                    match cancellable(cancel, update).await? {
                        Ok(()) => {
                            outcome.in_place_updated += 1;
                            self.logger
                                .log_pod_resized(&vpa.object_ref().to_string(), &pod.name);
                            return Ok(());
                        }
                        Err(e) => {
                            outcome.in_place_failed += 1;
                            self.logger.log_in_place_fallback(
                                &vpa.object_ref().to_string(),
                                &pod.name,
                                &e.to_string(),
                            );
                        }
                    }
                }
            }
        }

        self.evict(vpa, pod, restrictions, outcome, cancel).await
    }

    async fn evict(
        &self,
        vpa: &Vpa,
        pod: &Pod,
        restrictions: &Restrictions,
        outcome: &mut WorkloadOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.eviction_rate_limiter.try_acquire() {
            debug!(pod = %pod.object_ref(), "Eviction rate limit reached");
            outcome.skipped += 1;
            return Ok(());
        }

        if !restrictions.eviction.can_evict(pod) {
            debug!(pod = %pod.object_ref(), "Pod cannot be evicted right now");
            outcome.skipped += 1;
            return Ok(());
        }

        let eviction = restrictions
            .eviction
            .evict(pod, vpa, self.event_sink.as_ref());
        match cancellable(cancel, eviction).await? {
            Ok(()) => {
                outcome.evicted += 1;
                self.logger
                    .log_pod_evicted(&vpa.object_ref().to_string(), &pod.name);
            }
            Err(e) => {
                outcome.eviction_failed += 1;
                warn!(
                    workload = %vpa.object_ref(),
                    pod = %pod.object_ref(),
                    error = %e,
                    "Eviction failed"
                );
            }
        }
        Ok(())
    }
}
