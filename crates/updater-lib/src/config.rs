//! Updater configuration
//!
//! Injected into [`crate::updater::Updater`] at construction. Nothing in the
//! control loop reads process-global settings.

use serde::Deserialize;
use std::time::Duration;

/// Configuration of the reconciliation loop
#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterConfig {
    /// Evictions per second across the whole cluster; non-positive means unlimited
    #[serde(default = "default_rate_limit")]
    pub eviction_rate_limit: f64,

    /// Maximum burst of evictions
    #[serde(default = "default_rate_burst")]
    pub eviction_rate_burst: usize,

    /// In-place resizes per second; non-positive means unlimited
    #[serde(default = "default_rate_limit")]
    pub in_place_rate_limit: f64,

    /// Maximum burst of in-place resizes
    #[serde(default = "default_rate_burst")]
    pub in_place_rate_burst: usize,

    /// Timeout for the admission controller status check, in seconds
    #[serde(default = "default_status_check_timeout")]
    pub status_check_timeout_secs: u64,

    /// Namespaces whose VPA objects are never processed
    #[serde(default)]
    pub ignored_namespaces: Vec<String>,

    /// Whether the InPlaceOrRecreate mode is honored; when off it behaves like Auto
    #[serde(default)]
    pub in_place_or_recreate_enabled: bool,

    /// Whether the cycle is gated on the admission controller status
    #[serde(default = "default_true")]
    pub use_admission_controller_status: bool,
}

fn default_rate_limit() -> f64 {
    -1.0
}

fn default_rate_burst() -> usize {
    1
}

fn default_status_check_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            eviction_rate_limit: default_rate_limit(),
            eviction_rate_burst: default_rate_burst(),
            in_place_rate_limit: default_rate_limit(),
            in_place_rate_burst: default_rate_burst(),
            status_check_timeout_secs: default_status_check_timeout(),
            ignored_namespaces: Vec::new(),
            in_place_or_recreate_enabled: false,
            use_admission_controller_status: default_true(),
        }
    }
}

impl UpdaterConfig {
    pub fn status_check_timeout(&self) -> Duration {
        Duration::from_secs(self.status_check_timeout_secs)
    }

    pub fn is_namespace_ignored(&self, namespace: &str) -> bool {
        self.ignored_namespaces.iter().any(|ns| ns == namespace)
    }
}
