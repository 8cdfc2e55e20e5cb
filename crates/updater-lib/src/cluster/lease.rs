//! Admission controller heartbeat check

use super::ClusterError;
use crate::status::{is_heartbeat_fresh, StatusValidator};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::Lease;
use kube::{Api, Client};
use std::time::Duration;
use tracing::debug;

/// Treats the admission controller as healthy while it keeps renewing its Lease
#[derive(Clone)]
pub struct LeaseStatusValidator {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl LeaseStatusValidator {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
        }
    }
}

#[async_trait]
impl StatusValidator for LeaseStatusValidator {
    async fn is_status_valid(&self, timeout: Duration) -> anyhow::Result<bool> {
        let lease = self
            .api
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Lease".to_string(),
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            })?;

        let renew_time = lease.spec.and_then(|s| s.renew_time).map(|t| t.0);
        let fresh = is_heartbeat_fresh(renew_time, Utc::now(), timeout);
        debug!(
            lease = %self.name,
            renew_time = ?renew_time,
            fresh,
            "Checked admission controller lease"
        );
        Ok(fresh)
    }
}
