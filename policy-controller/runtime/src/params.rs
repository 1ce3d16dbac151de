use crate::{
    core::ParamKindRef,
    index::{IgnoreParams, ParamLoop, ReconcileLoop, SpawnParamWatch},
    k8s::{watcher, Api, ApiResource, Client, DynamicObject},
};
use futures::prelude::*;
use kube::runtime::WatchStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

/// Watches parameter kinds through the Kubernetes API.
#[derive(Clone)]
pub struct KubeParamWatches {
    client: Client,
}

impl KubeParamWatches {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SpawnParamWatch for KubeParamWatches {
    fn spawn(
        &self,
        kind: &ParamKindRef,
        resource: &ApiResource,
        shutdown: CancellationToken,
    ) -> ParamLoop {
        let api = Api::<DynamicObject>::all_with(self.client.clone(), resource);
        let events = watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(error) => {
                        warn!(%error, "Parameter watch failed");
                        None
                    }
                }
            });

        let params = ReconcileLoop::new(events);
        let handle = params.handle();
        tokio::spawn(
            params
                .run(Arc::new(IgnoreParams), shutdown)
                .instrument(info_span!("params", %kind)),
        );
        handle
    }
}
