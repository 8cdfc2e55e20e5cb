//! Error types for whole-cycle failures
//!
//! Per-workload and per-pod failures never surface here; they are logged and
//! skipped where they happen.

use crate::updater::CycleOutcome;
use thiserror::Error;

/// Failures that end a reconciliation cycle early
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("failed to list VPA objects: {0}")]
    ListWorkloads(anyhow::Error),

    #[error("failed to list pods: {0}")]
    ListPods(anyhow::Error),

    /// Work finished before the cancellation is kept in `partial`
    #[error("cycle cancelled")]
    Cancelled { partial: CycleOutcome },
}

impl UpdaterError {
    pub(crate) fn cancelled() -> Self {
        Self::Cancelled {
            partial: CycleOutcome::default(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
