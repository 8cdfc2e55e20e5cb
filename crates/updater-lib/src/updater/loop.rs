//! Periodic driver for the updater
//!
//! Runs one reconciliation cycle per tick and feeds the result into metrics
//! and health. A shutdown cancels the cycle in flight.

use super::{CycleOutcome, Updater};
use crate::error::UpdaterError;
use crate::health::{components, HealthRegistry};
use crate::observability::{StructuredLogger, UpdaterMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs [`Updater::run_once`] on a fixed interval
pub struct UpdaterLoop {
    updater: Arc<Updater>,
    interval: Duration,
    health: HealthRegistry,
    metrics: UpdaterMetrics,
    logger: StructuredLogger,
}

impl UpdaterLoop {
    pub fn new(updater: Arc<Updater>, interval: Duration, health: HealthRegistry) -> Self {
        Self {
            updater,
            interval,
            health,
            metrics: UpdaterMetrics::new(),
            logger: StructuredLogger::new("vpa-updater"),
        }
    }

    /// Run cycles until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting updater loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(&shutdown).await;
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down updater loop");
                    break;
                }
            }
        }
    }

    /// Run one cycle and record its result
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Option<CycleOutcome> {
        let start = Instant::now();
        let result = self.updater.run_once(cancel).await;
        let elapsed = start.elapsed();
        self.metrics.observe_cycle_duration(elapsed);

        match result {
            Ok(outcome) => {
                self.metrics.record_cycle(&outcome);
                self.logger.log_cycle_summary(&outcome, elapsed);

                self.health.set_healthy(components::UPDATER_LOOP).await;
                if self.updater.status_gate_open() {
                    self.health.set_healthy(components::STATUS_GATE).await;
                } else {
                    self.health
                        .set_degraded(
                            components::STATUS_GATE,
                            "admission controller status is not valid",
                        )
                        .await;
                }
                self.health.mark_cycle_done().await;
                Some(outcome)
            }
            Err(UpdaterError::Cancelled { partial }) => {
                self.metrics.record_disruptions(&partial);
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    evicted = partial.total_evicted(),
                    in_place_updated = partial.total_in_place_updated(),
                    "Cycle cancelled"
                );
                None
            }
            Err(e) => {
                error!(error = %e, "Reconciliation cycle failed");
                self.health
                    .set_unhealthy(components::UPDATER_LOOP, e.to_string())
                    .await;
                None
            }
        }
    }
}
