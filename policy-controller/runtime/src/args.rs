use crate::{
    index::{ControllerMetrics, PolicyController},
    k8s::{self, watcher},
    DiscoveryResolver, ExpressionCompiler, KubeParamWatches,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "admission-policy",
    about = "A validating admission policy controller"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "admission_policy_controller=info,warn",
        env = "ADMISSION_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// How often API discovery is refreshed when resolving parameter kinds.
    #[clap(long, default_value = "30")]
    discovery_refresh_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            discovery_refresh_secs,
        } = self;

        if discovery_refresh_secs == 0 {
            bail!("--discovery-refresh-secs must be greater than zero");
        }

        let mut prom = <Registry>::default();
        let metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("admission_policy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Resolve parameter kinds against periodically refreshed discovery.
        let resolver = DiscoveryResolver::default();
        tokio::spawn(
            resolver
                .clone()
                .run(
                    runtime.client(),
                    Duration::from_secs(discovery_refresh_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("discovery")),
        );

        let definitions = runtime.watch_all::<k8s::Definition>(watcher::Config::default());
        let bindings = runtime.watch_all::<k8s::Binding>(watcher::Config::default());
        let controller = PolicyController::new(
            definitions,
            bindings,
            Arc::new(ExpressionCompiler),
            Arc::new(resolver),
            Arc::new(KubeParamWatches::new(runtime.client())),
            metrics,
        );

        // The admin server reports ready once both definitions and bindings
        // have been listed.
        let initialized = runtime.initialized_handle();
        tokio::spawn({
            let controller = controller.clone();
            async move {
                controller.synced().await;
                info!("Policy controller synced");
                drop(initialized);
            }
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            controller
                .run(shutdown.clone())
                .instrument(info_span!("policy_controller")),
        );
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = drain.signaled().await;
            shutdown.cancel();
            if let Err(error) = release.release_after(task).await {
                warn!(%error, "Policy controller failed");
            }
        });

        // Runs until the shutdown signal fires and the controller has released
        // its drain handle.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
