//! Observability infrastructure for the updater
//!
//! Provides:
//! - Prometheus metrics (cycle duration, disruption counters, status gate state)
//! - Structured JSON logging with tracing

use crate::updater::CycleOutcome;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<UpdaterMetricsInner> = OnceLock::new();

struct UpdaterMetricsInner {
    cycle_duration_seconds: Histogram,
    evicted_pods: IntCounter,
    in_place_updated_pods: IntCounter,
    failed_evictions: IntCounter,
    failed_in_place_updates: IntCounter,
    deferred_pods: IntCounter,
    controlled_pods: IntGaugeVec,
    status_gate_open: IntGauge,
}

impl UpdaterMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "vpa_updater_cycle_duration_seconds",
                "Time spent in one reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            evicted_pods: register_int_counter!(
                "vpa_updater_evicted_pods_total",
                "Number of pods evicted to apply a recommendation"
            )
            .expect("Failed to register evicted_pods_total"),

            in_place_updated_pods: register_int_counter!(
                "vpa_updater_in_place_updated_pods_total",
                "Number of pods resized in place"
            )
            .expect("Failed to register in_place_updated_pods_total"),

            failed_evictions: register_int_counter!(
                "vpa_updater_failed_evictions_total",
                "Number of eviction attempts that failed"
            )
            .expect("Failed to register failed_evictions_total"),

            failed_in_place_updates: register_int_counter!(
                "vpa_updater_failed_in_place_updates_total",
                "Number of in-place resize attempts that failed"
            )
            .expect("Failed to register failed_in_place_updates_total"),

            deferred_pods: register_int_counter!(
                "vpa_updater_deferred_pods_total",
                "Number of pods whose in-place update was deferred"
            )
            .expect("Failed to register deferred_pods_total"),

            controlled_pods: register_int_gauge_vec!(
                "vpa_updater_controlled_pods",
                "Live pods matched to a VPA in the last cycle, by update mode",
                &["update_mode"]
            )
            .expect("Failed to register controlled_pods"),

            status_gate_open: register_int_gauge!(
                "vpa_updater_status_gate_open",
                "1 if the last cycle passed the admission controller status gate"
            )
            .expect("Failed to register status_gate_open"),
        }
    }
}

/// Lightweight handle to the global updater metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct UpdaterMetrics {
    _private: (),
}

impl Default for UpdaterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdaterMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(UpdaterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &UpdaterMetricsInner {
        GLOBAL_METRICS.get_or_init(UpdaterMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, elapsed: Duration) {
        self.inner()
            .cycle_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_status_gate_open(&self, open: bool) {
        self.inner().status_gate_open.set(i64::from(open));
    }

    #[cfg(test)]
    pub(crate) fn evicted_total(&self) -> u64 {
        self.inner().evicted_pods.get()
    }

    /// Fold a finished cycle into the counters and gauges
    pub fn record_cycle(&self, outcome: &CycleOutcome) {
        let inner = self.inner();
        inner.controlled_pods.reset();
        for workload in &outcome.workloads {
            inner
                .controlled_pods
                .with_label_values(&[workload.update_mode.as_str()])
                .add(workload.controlled_pods as i64);
        }

        self.record_disruptions(outcome);
    }

    /// Count disruptions without touching the per-cycle gauges
    ///
    /// Used on its own for cycles cut short by a shutdown.
    pub fn record_disruptions(&self, outcome: &CycleOutcome) {
        let inner = self.inner();
        for workload in &outcome.workloads {
            inner.evicted_pods.inc_by(workload.evicted as u64);
            inner.in_place_updated_pods.inc_by(workload.in_place_updated as u64);
            inner.failed_evictions.inc_by(workload.eviction_failed as u64);
            inner
                .failed_in_place_updates
                .inc_by(workload.in_place_failed as u64);
            inner.deferred_pods.inc_by(workload.deferred as u64);
        }
    }
}

/// Structured logger for updater events
///
/// Emits stable `event = "..."` records so log pipelines can
/// follow disruptions without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, interval: Duration) {
        info!(
            event = "updater_started",
            component = %self.component,
            version = %version,
            interval_secs = interval.as_secs(),
            "VPA updater started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "updater_shutdown",
            component = %self.component,
            reason = %reason,
            "VPA updater shutting down"
        );
    }

    pub fn log_pod_evicted(&self, workload: &str, pod: &str) {
        info!(
            event = "pod_evicted",
            component = %self.component,
            workload = %workload,
            pod = %pod,
            "Evicted pod to apply recommendation"
        );
    }

    pub fn log_pod_resized(&self, workload: &str, pod: &str) {
        info!(
            event = "pod_resized_in_place",
            component = %self.component,
            workload = %workload,
            pod = %pod,
            "Resized pod in place"
        );
    }

    pub fn log_in_place_fallback(&self, workload: &str, pod: &str, error: &str) {
        warn!(
            event = "in_place_fallback",
            component = %self.component,
            workload = %workload,
            pod = %pod,
            error = %error,
            "In-place update failed, falling back to eviction"
        );
    }

    pub fn log_status_gate_closed(&self, reason: &str) {
        warn!(
            event = "status_gate_closed",
            component = %self.component,
            reason = %reason,
            "Admission controller status is not valid, skipping cycle"
        );
    }

    pub fn log_cycle_summary(&self, outcome: &CycleOutcome, elapsed: Duration) {
        info!(
            event = "cycle_complete",
            component = %self.component,
            workloads = outcome.workloads.len(),
            evicted = outcome.total_evicted(),
            in_place_updated = outcome.total_in_place_updated(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation cycle complete"
        );
    }
}
