//! Whole-cycle status gate
//!
//! The admission controller keeps a heartbeat object fresh. While that
//! heartbeat is stale the updater must not disrupt anything, because recreated
//! pods would not receive their new requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Reports whether the surrounding system is healthy enough for disruption
#[async_trait]
pub trait StatusValidator: Send + Sync {
    async fn is_status_valid(&self, timeout: Duration) -> anyhow::Result<bool>;
}

/// A heartbeat is fresh when it was renewed no longer than `timeout` ago
pub fn is_heartbeat_fresh(
    renew_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let Some(renewed) = renew_time else {
        return false;
    };
    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return true;
    };
    now.signed_duration_since(renewed) <= timeout
}
