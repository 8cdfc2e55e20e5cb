//! Process configuration

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use updater_lib::restriction::ReplicaGroupConfig;
use updater_lib::UpdaterConfig;

/// Updater process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Seconds between reconciliation cycles
    #[serde(default = "default_updater_interval")]
    pub updater_interval_secs: u64,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Namespace of the admission controller heartbeat Lease
    #[serde(default = "default_admission_controller_namespace")]
    pub admission_controller_namespace: String,

    /// Name of the admission controller heartbeat Lease
    #[serde(default = "default_admission_controller_lease")]
    pub admission_controller_lease: String,

    /// Minimum running replicas before a replica group may be disrupted
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Fraction of a replica group that may be disrupted per cycle
    #[serde(default = "default_eviction_tolerance")]
    pub eviction_tolerance: f64,

    /// Seconds an in-place resize may stay pending before the pod is evicted
    #[serde(default = "default_in_place_deferral_timeout")]
    pub in_place_deferral_timeout_secs: u64,

    /// Seconds a resolved owner chain is reused before it is read again
    #[serde(default = "default_controller_cache_ttl")]
    pub controller_cache_ttl_secs: u64,

    #[serde(flatten)]
    pub updater: UpdaterConfig,
}

fn default_updater_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    8080
}

fn default_admission_controller_namespace() -> String {
    "kube-system".to_string()
}

fn default_admission_controller_lease() -> String {
    "vpa-admission-controller".to_string()
}

fn default_min_replicas() -> usize {
    2
}

fn default_eviction_tolerance() -> f64 {
    0.5
}

fn default_in_place_deferral_timeout() -> u64 {
    300
}

fn default_controller_cache_ttl() -> u64 {
    600
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("UPDATER")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("ignored_namespaces")
}

impl AppConfig {
    /// Load configuration from `UPDATER_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_environment(environment())
    }

    fn from_environment(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder().add_source(env).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn updater_interval(&self) -> Duration {
        Duration::from_secs(self.updater_interval_secs)
    }

    pub fn controller_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.controller_cache_ttl_secs)
    }

    pub fn replica_group(&self) -> ReplicaGroupConfig {
        ReplicaGroupConfig {
            min_replicas: self.min_replicas,
            eviction_tolerance: self.eviction_tolerance,
            in_place_deferral_timeout: Duration::from_secs(self.in_place_deferral_timeout_secs),
        }
    }
}
