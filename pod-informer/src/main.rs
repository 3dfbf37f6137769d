//! Watches pods and logs every change an informer delivers
//!
//! Reads `KUBECONFIG` (required) and `NAMESPACE` (optional, all namespaces when unset),
//! then runs until SIGINT or SIGTERM.

mod config;
mod handler;

use anyhow::Context;
use config::Settings;
use handler::LogHandler;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use kube_informer::{client::ApiListerWatcher, wait_for_cache_sync, Informer, InformerConfig};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    let client = connect(&settings.kubeconfig).await?;
    let version = client
        .apiserver_version()
        .await
        .context("failed to reach the API server")?;
    info!(
        version = %version.git_version,
        namespace = settings.namespace.as_deref().unwrap_or("<all>"),
        "connected to API server"
    );

    let pods: Api<Pod> = match &settings.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let informer: Informer<Pod, _> = Informer::new(
        ApiListerWatcher::new(pods),
        InformerConfig::default().resync_period(settings.resync_period),
    );
    informer.add_handler(LogHandler, Some(settings.handler_resync_period))?;
    let handle = informer.handle();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { informer.run(cancel).await }
    });

    if wait_for_cache_sync(&[handle.sync_barrier()], &cancel, settings.cache_sync_timeout).await {
        info!(pods = handle.store().len(), "caches synced");
    } else if !cancel.is_cancelled() {
        cancel.cancel();
        run.await.context("informer task failed")??;
        anyhow::bail!("timed out waiting for caches to sync");
    }

    run.await.context("informer task failed")??;
    info!("shut down cleanly");
    Ok(())
}

async fn connect(path: &Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig from {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to load kubeconfig")?;
    Client::try_from(config).context("failed to create client")
}

/// Fires `cancel` on the first SIGINT or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "unable to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received SIGINT, stopping"),
        () = terminate => info!("received SIGTERM, stopping"),
    }
    cancel.cancel();
}
