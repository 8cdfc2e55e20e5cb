//! Target and owner resolution against the API server

use super::convert::{parse_selector, selector_from_kube};
use super::{api_resource, well_known_api_version, ClusterError};
use crate::models::{ControllerKey, Vpa};
use crate::selector::LabelSelector;
use crate::target::{ControllerFetcher, NodeInvalidOwner, SelectorFetcher};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as KubeLabelSelector;
use kube::api::{Api, DynamicObject};
use kube::Client;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

fn dynamic_api(
    client: &Client,
    namespace: &str,
    api_version: &str,
    kind: &str,
) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &api_resource(api_version, kind))
}

fn pointer<'a>(obj: &'a DynamicObject, path: &str) -> Option<&'a Value> {
    let (head, rest) = path.trim_start_matches('/').split_once('/')?;
    obj.data.get(head)?.pointer(&format!("/{}", rest))
}

/// Pod selector of a well-known controller object
fn selector_of(kind: &str, obj: &DynamicObject) -> Result<Option<LabelSelector>, ClusterError> {
    let invalid = |e: serde_json::Error| ClusterError::InvalidSelector(e.to_string());

    match kind {
        "ReplicationController" => {
            let Some(value) = pointer(obj, "/spec/selector") else {
                return Ok(None);
            };
            let labels: BTreeMap<String, String> =
                serde_json::from_value(value.clone()).map_err(invalid)?;
            Ok(Some(LabelSelector::from_labels(labels)))
        }
        "CronJob" => {
            let Some(value) = pointer(obj, "/spec/jobTemplate/spec/template/metadata/labels") else {
                return Ok(None);
            };
            let labels: BTreeMap<String, String> =
                serde_json::from_value(value.clone()).map_err(invalid)?;
            Ok(Some(LabelSelector::from_labels(labels)))
        }
        _ => {
            let Some(value) = pointer(obj, "/spec/selector") else {
                return Ok(None);
            };
            let selector: KubeLabelSelector =
                serde_json::from_value(value.clone()).map_err(invalid)?;
            selector_from_kube(&selector).map(Some)
        }
    }
}

/// Resolves a VPA target to the pod selector of the target controller
///
/// Well-known controllers are read directly. Any other kind must expose a
/// `scale` subresource whose status carries the selector string.
#[derive(Clone)]
pub struct KubeSelectorFetcher {
    client: Client,
}

impl KubeSelectorFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SelectorFetcher for KubeSelectorFetcher {
    async fn fetch(&self, vpa: &Vpa) -> anyhow::Result<LabelSelector> {
        let target = vpa
            .target_ref
            .as_ref()
            .ok_or_else(|| ClusterError::NoTargetRef(vpa.object_ref().to_string()))?;
        let api = dynamic_api(&self.client, &vpa.namespace, &target.api_version, &target.kind);
        let no_selector = || ClusterError::NoSelector {
            kind: target.kind.clone(),
            namespace: vpa.namespace.clone(),
            name: target.name.clone(),
        };

        if well_known_api_version(&target.kind).is_some() {
            let obj = api
                .get_opt(&target.name)
                .await?
                .ok_or_else(|| ClusterError::NotFound {
                    kind: target.kind.clone(),
                    namespace: vpa.namespace.clone(),
                    name: target.name.clone(),
                })?;
            return Ok(selector_of(&target.kind, &obj)?.ok_or_else(no_selector)?);
        }

        let scale = api.get_subresource("scale", &target.name).await?;
        let raw = pointer(&scale, "/status/selector")
            .and_then(Value::as_str)
            .ok_or_else(no_selector)?;
        Ok(parse_selector(raw)?)
    }
}

/// Walks controller owner references up to the top-most well-known or
/// scalable controller
#[derive(Clone)]
pub struct KubeControllerFetcher {
    client: Client,
}

impl KubeControllerFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn is_scalable(&self, key: &ControllerKey) -> bool {
        let api = dynamic_api(&self.client, &key.namespace, &key.api_version, &key.kind);
        match api.get_subresource("scale", &key.name).await {
            Ok(_) => true,
            Err(e) => {
                debug!(controller = %key, error = %e, "Controller has no scale subresource");
                false
            }
        }
    }
}

fn controller_owner(obj: &DynamicObject, namespace: &str) -> Option<ControllerKey> {
    obj.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .map(|r| ControllerKey {
            namespace: namespace.to_string(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            api_version: r.api_version.clone(),
        })
}

#[async_trait]
impl ControllerFetcher for KubeControllerFetcher {
    async fn find_topmost_well_known_or_scalable(
        &self,
        key: &ControllerKey,
    ) -> anyhow::Result<Option<ControllerKey>> {
        let mut visited = HashSet::new();
        let mut current = key.clone();
        let mut topmost = None;

        loop {
            if current.kind == "Node" {
                return Err(NodeInvalidOwner.into());
            }
            if !visited.insert(current.clone()) {
                return Err(ClusterError::OwnerCycle(current.to_string()).into());
            }

            let api = dynamic_api(
                &self.client,
                &current.namespace,
                &current.api_version,
                &current.kind,
            );
            let obj = api
                .get_opt(&current.name)
                .await?
                .ok_or_else(|| ClusterError::NotFound {
                    kind: current.kind.clone(),
                    namespace: current.namespace.clone(),
                    name: current.name.clone(),
                })?;

            if well_known_api_version(&current.kind).is_some() || self.is_scalable(&current).await {
                topmost = Some(current.clone());
            }

            match controller_owner(&obj, &current.namespace) {
                Some(owner) => current = owner,
                None => return Ok(topmost),
            }
        }
    }
}
