//! Conversion from Kubernetes objects into updater models

use super::ClusterError;
use crate::models::{
    Container, ContainerRecommendation, ContainerResourcePolicy, ControllerKey, Pod, PodPhase,
    ResourceRequests, TargetRef, UpdateMode, Vpa,
};
use crate::selector::{LabelSelector, SelectorOperator, SelectorRequirement};
use k8s_openapi::api::core::v1::Pod as KubePod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as KubeLabelSelector;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Parse a Kubernetes quantity into base units (cores, bytes)
pub fn parse_quantity(raw: &str) -> Result<f64, ClusterError> {
    let s = raw.trim();
    let invalid = || ClusterError::InvalidQuantity(raw.to_string());

    const SUFFIXES: [(&str, f64); 14] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
        ("", 1.0),
    ];
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .ok_or_else(invalid)?;

    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    // Division keeps milli values exact, e.g. 100m is exactly 0.1
    if multiplier < 1.0 {
        return Ok(value / 1000.0);
    }
    Ok(value * multiplier)
}

fn quantity_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read `cpu` and `memory` out of a resource list; missing entries are zero
fn requests_from_list<'a, I>(entries: I) -> Result<ResourceRequests, ClusterError>
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut requests = ResourceRequests::default();
    for (name, raw) in entries {
        match name {
            "cpu" => requests.cpu_millicores = (parse_quantity(&raw)? * 1000.0).round() as u64,
            "memory" => requests.memory_bytes = parse_quantity(&raw)?.round() as u64,
            _ => {}
        }
    }
    Ok(requests)
}

fn requests_from_json(list: &BTreeMap<String, Value>) -> Result<ResourceRequests, ClusterError> {
    requests_from_list(
        list.iter()
            .filter_map(|(k, v)| quantity_str(v).map(|q| (k.as_str(), q))),
    )
}

/// Convert a pod; the controller owner reference becomes `owner`
pub fn pod_from_kube(pod: &KubePod) -> Result<Pod, ClusterError> {
    let meta = &pod.metadata;
    let name = meta
        .name
        .clone()
        .ok_or(ClusterError::MissingField("metadata.name"))?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());

    let owner = meta
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .map(|r| ControllerKey {
            namespace: namespace.clone(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            api_version: r.api_version.clone(),
        });

    let mut containers = Vec::new();
    for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(|list| requests_from_list(list.iter().map(|(k, q)| (k.as_str(), q.0.clone()))))
            .transpose()?
            .unwrap_or_default();
        containers.push(Container {
            name: container.name.clone(),
            requests,
        });
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::parse)
        .unwrap_or(PodPhase::Unknown);

    Ok(Pod {
        uid: meta
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}/{}", namespace, name)),
        labels: meta.labels.clone().unwrap_or_default(),
        owner,
        containers,
        phase,
        creation_timestamp: meta.creation_timestamp.as_ref().map(|t| t.0),
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        name,
        namespace,
    })
}

/// Update mode as written in `spec.updatePolicy.updateMode`
///
/// `Recreate` is the older name of `Auto` and behaves the same here.
pub fn parse_update_mode(raw: &str) -> Result<UpdateMode, ClusterError> {
    match raw {
        "Off" => Ok(UpdateMode::Off),
        "Initial" => Ok(UpdateMode::Initial),
        "Auto" | "Recreate" => Ok(UpdateMode::Auto),
        "InPlaceOrRecreate" => Ok(UpdateMode::InPlaceOrRecreate),
        other => Err(ClusterError::UnknownUpdateMode(other.to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaSpec {
    target_ref: Option<TargetRef>,
    #[serde(default)]
    update_policy: Option<UpdatePolicy>,
    #[serde(default)]
    resource_policy: Option<ResourcePolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePolicy {
    update_mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourcePolicy {
    #[serde(default)]
    container_policies: Vec<ContainerPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPolicy {
    container_name: String,
    min_allowed: Option<BTreeMap<String, Value>>,
    max_allowed: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaStatus {
    recommendation: Option<Recommendation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recommendation {
    #[serde(default)]
    container_recommendations: Vec<RecommendationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationEntry {
    container_name: String,
    #[serde(default)]
    target: BTreeMap<String, Value>,
    lower_bound: Option<BTreeMap<String, Value>>,
    upper_bound: Option<BTreeMap<String, Value>>,
}

fn optional_requests(
    list: Option<&BTreeMap<String, Value>>,
) -> Result<Option<ResourceRequests>, ClusterError> {
    list.map(requests_from_json).transpose()
}

fn field<T: DeserializeOwned + Default>(
    obj: &DynamicObject,
    key: &str,
    name: &str,
) -> Result<T, ClusterError> {
    match obj.data.get(key) {
        Some(value) => T::deserialize(value).map_err(|source| ClusterError::MalformedVpa {
            name: name.to_string(),
            source,
        }),
        None => Ok(T::default()),
    }
}

/// Convert a `VerticalPodAutoscaler` custom object
pub fn vpa_from_dynamic(obj: &DynamicObject) -> Result<Vpa, ClusterError> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or(ClusterError::MissingField("metadata.name"))?;
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let spec: VpaSpec = field(obj, "spec", &name)?;
    let status: VpaStatus = field(obj, "status", &name)?;

    let update_mode = spec
        .update_policy
        .and_then(|p| p.update_mode)
        .map(|m| parse_update_mode(&m))
        .transpose()?;

    let mut resource_policy = Vec::new();
    for policy in spec.resource_policy.unwrap_or_default().container_policies {
        resource_policy.push(ContainerResourcePolicy {
            container_name: policy.container_name,
            min_allowed: optional_requests(policy.min_allowed.as_ref())?,
            max_allowed: optional_requests(policy.max_allowed.as_ref())?,
        });
    }

    let mut recommendation = Vec::new();
    for entry in status
        .recommendation
        .unwrap_or_default()
        .container_recommendations
    {
        recommendation.push(ContainerRecommendation {
            container_name: entry.container_name,
            target: requests_from_json(&entry.target)?,
            lower_bound: optional_requests(entry.lower_bound.as_ref())?,
            upper_bound: optional_requests(entry.upper_bound.as_ref())?,
        });
    }

    Ok(Vpa {
        name,
        namespace,
        target_ref: spec.target_ref,
        update_mode,
        creation_timestamp: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        resource_policy,
        recommendation,
    })
}

/// Convert a structured `metav1.LabelSelector`
pub fn selector_from_kube(selector: &KubeLabelSelector) -> Result<LabelSelector, ClusterError> {
    let mut result = LabelSelector {
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        match_expressions: Vec::new(),
    };
    for expr in selector.match_expressions.iter().flatten() {
        let operator = match expr.operator.as_str() {
            "In" => SelectorOperator::In,
            "NotIn" => SelectorOperator::NotIn,
            "Exists" => SelectorOperator::Exists,
            "DoesNotExist" => SelectorOperator::DoesNotExist,
            other => return Err(ClusterError::InvalidSelector(other.to_string())),
        };
        result.match_expressions.push(SelectorRequirement {
            key: expr.key.clone(),
            operator,
            values: expr.values.clone().unwrap_or_default(),
        });
    }
    Ok(result)
}

/// Split on commas that are not inside a `(...)` value set
fn split_terms(raw: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(raw[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(raw[start..].trim());
    terms.into_iter().filter(|t| !t.is_empty()).collect()
}

fn value_set(raw: &str) -> Result<Vec<String>, ClusterError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| ClusterError::InvalidSelector(raw.to_string()))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Parse the string form used by the scale subresource, e.g. `app=web,tier in (a,b)`
pub fn parse_selector(raw: &str) -> Result<LabelSelector, ClusterError> {
    let mut selector = LabelSelector::default();

    for term in split_terms(raw) {
        if let Some(key) = term.strip_prefix('!') {
            selector.match_expressions.push(SelectorRequirement {
                key: key.trim().to_string(),
                operator: SelectorOperator::DoesNotExist,
                values: Vec::new(),
            });
        } else if let Some((key, value)) = term.split_once("!=") {
            selector.match_expressions.push(SelectorRequirement {
                key: key.trim().to_string(),
                operator: SelectorOperator::NotIn,
                values: vec![value.trim().to_string()],
            });
        } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
            selector
                .match_labels
                .insert(key.trim().to_string(), value.trim().to_string());
        } else if let Some((key, values)) = term.split_once(" notin ") {
            selector.match_expressions.push(SelectorRequirement {
                key: key.trim().to_string(),
                operator: SelectorOperator::NotIn,
                values: value_set(values)?,
            });
        } else if let Some((key, values)) = term.split_once(" in ") {
            selector.match_expressions.push(SelectorRequirement {
                key: key.trim().to_string(),
                operator: SelectorOperator::In,
                values: value_set(values)?,
            });
        } else if term.chars().all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c)) {
            selector.match_expressions.push(SelectorRequirement {
                key: term.to_string(),
                operator: SelectorOperator::Exists,
                values: Vec::new(),
            });
        } else {
            return Err(ClusterError::InvalidSelector(term.to_string()));
        }
    }

    Ok(selector)
}
