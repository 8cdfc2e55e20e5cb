//! Resolution of a VPA's target into pods
//!
//! The selector fetcher maps a VPA to the label selector of the controller it
//! targets. The controller fetcher walks owner references up to the top-most
//! controller that is well known or exposes a scale subresource.

use crate::models::{ControllerKey, Pod, Vpa};
use crate::selector::LabelSelector;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Maps a VPA to the pod label selector of its target
#[async_trait]
pub trait SelectorFetcher: Send + Sync {
    async fn fetch(&self, vpa: &Vpa) -> anyhow::Result<LabelSelector>;
}

/// Finds the top-most well-known or scalable controller for a controller key
#[async_trait]
pub trait ControllerFetcher: Send + Sync {
    async fn find_topmost_well_known_or_scalable(
        &self,
        key: &ControllerKey,
    ) -> anyhow::Result<Option<ControllerKey>>;
}

/// Returned when a pod claims a node as its controller (static pods)
#[derive(Debug, thiserror::Error)]
#[error("node is not a valid owner")]
pub struct NodeInvalidOwner;

/// Remembers the answers of another controller fetcher for `ttl`
///
/// Pods of one controller share an owner, so a cycle resolves each owner
/// chain once instead of once per pod. Failures are not cached.
pub struct CachedControllerFetcher {
    inner: Arc<dyn ControllerFetcher>,
    ttl: Duration,
    cache: DashMap<ControllerKey, (Instant, Option<ControllerKey>)>,
}

impl CachedControllerFetcher {
    pub fn new(inner: Arc<dyn ControllerFetcher>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Number of cached owner chains, fresh or not
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn fresh(&self, key: &ControllerKey) -> Option<Option<ControllerKey>> {
        let entry = self.cache.get(key)?;
        let (cached_at, top) = entry.value();
        (cached_at.elapsed() < self.ttl).then(|| top.clone())
    }
}

#[async_trait]
impl ControllerFetcher for CachedControllerFetcher {
    async fn find_topmost_well_known_or_scalable(
        &self,
        key: &ControllerKey,
    ) -> anyhow::Result<Option<ControllerKey>> {
        if let Some(top) = self.fresh(key) {
            return Ok(top);
        }

        let top = self.inner.find_topmost_well_known_or_scalable(key).await?;
        self.cache.retain(|_, (cached_at, _)| cached_at.elapsed() < self.ttl);
        self.cache.insert(key.clone(), (Instant::now(), top.clone()));
        Ok(top)
    }
}

/// Whether `pod` is controlled by the controller `vpa` targets
pub async fn is_controlled_by(
    fetcher: &dyn ControllerFetcher,
    vpa: &Vpa,
    pod: &Pod,
) -> anyhow::Result<bool> {
    let (Some(target), Some(owner)) = (vpa.target_ref.as_ref(), pod.owner.as_ref()) else {
        return Ok(false);
    };

    let Some(top) = fetcher.find_topmost_well_known_or_scalable(owner).await? else {
        return Ok(false);
    };

    Ok(top.kind == target.kind && top.name == target.name && top.namespace == vpa.namespace)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Returns the key it was given, rejecting `Node`
    #[derive(Debug, Default, Clone)]
    pub struct IdentityControllerFetcher;

    #[async_trait]
    impl ControllerFetcher for IdentityControllerFetcher {
        async fn find_topmost_well_known_or_scalable(
            &self,
            key: &ControllerKey,
        ) -> anyhow::Result<Option<ControllerKey>> {
            if key.kind == "Node" {
                return Err(NodeInvalidOwner.into());
            }
            Ok(Some(key.clone()))
        }
    }

    /// Counts lookups before delegating to [`IdentityControllerFetcher`]
    #[derive(Debug, Default)]
    pub struct CountingControllerFetcher {
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl CountingControllerFetcher {
        pub fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ControllerFetcher for CountingControllerFetcher {
        async fn find_topmost_well_known_or_scalable(
            &self,
            key: &ControllerKey,
        ) -> anyhow::Result<Option<ControllerKey>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            IdentityControllerFetcher
                .find_topmost_well_known_or_scalable(key)
                .await
        }
    }
}
