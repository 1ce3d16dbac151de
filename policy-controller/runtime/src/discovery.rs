use crate::{
    core::{ResolveError, ResolveParamKind},
    k8s::{ApiResource, Client, Discovery, GroupVersionKind},
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, warn};

/// Resolves parameter kinds against the API server's discovery information.
///
/// Lookups read the most recent successful discovery run and never block on
/// the API server. Discovery is refreshed periodically by [`Self::run`], so a
/// kind that is registered later becomes resolvable on the next refresh.
#[derive(Clone, Default)]
pub struct DiscoveryResolver {
    discovery: Arc<RwLock<Option<Discovery>>>,
}

// === impl DiscoveryResolver ===

impl DiscoveryResolver {
    /// Refreshes discovery every `period` until `shutdown` is signaled.
    pub async fn run(self, client: Client, period: time::Duration, shutdown: drain::Watch) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }
            }

            match self.refresh(client.clone()).await {
                Ok(groups) => debug!(groups, "Refreshed API discovery"),
                Err(error) => warn!(%error, "Failed to discover API resources"),
            }
        }
    }

    /// Runs discovery once, replacing the previous result on success.
    ///
    /// Returns the number of API groups discovered.
    pub async fn refresh(&self, client: Client) -> Result<usize, kube::Error> {
        let discovery = Discovery::new(client).run().await?;
        let groups = discovery.groups().count();
        *self.discovery.write() = Some(discovery);
        Ok(groups)
    }

    pub fn is_available(&self) -> bool {
        self.discovery.read().is_some()
    }
}

impl ResolveParamKind for DiscoveryResolver {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, ResolveError> {
        let discovery = self.discovery.read();
        let discovery = discovery.as_ref().ok_or(ResolveError::Unavailable)?;
        discovery
            .resolve_gvk(gvk)
            .map(|(resource, _caps)| resource)
            .ok_or_else(|| ResolveError::not_found(gvk))
    }
}

impl std::fmt::Debug for DiscoveryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResolver")
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_before_first_refresh() {
        let resolver = DiscoveryResolver::default();
        assert!(!resolver.is_available());
        assert!(matches!(
            resolver.resolve(&GroupVersionKind::gvk("", "v1", "ConfigMap")),
            Err(ResolveError::Unavailable)
        ));
    }
}
