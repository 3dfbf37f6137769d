//! Waits for informer caches to become usable
use crate::controller::SyncBarrier;
use futures::future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wait until every barrier in `barriers` has synced
///
/// Returns `true` once all caches are synced, and `false` if `cancel` fires or `timeout`
/// elapses first. Callers that need a complete cache before acting should treat `false`
/// as a failure to start.
///
/// # Usage
///
/// ```no_run
/// # use kube_informer::{controller::InformerHandle, wait::wait_for_cache_sync};
/// # use std::time::Duration;
/// # use tokio_util::sync::CancellationToken;
/// # async fn wrapper(pods: InformerHandle<()>, nodes: InformerHandle<()>) {
/// let cancel = CancellationToken::new();
/// let barriers = [pods.sync_barrier(), nodes.sync_barrier()];
/// if !wait_for_cache_sync(&barriers, &cancel, Duration::from_secs(60)).await {
///     panic!("timed out waiting for caches to sync");
/// }
/// # }
/// ```
pub async fn wait_for_cache_sync(barriers: &[SyncBarrier], cancel: &CancellationToken, timeout: Duration) -> bool {
    if barriers.iter().all(SyncBarrier::has_synced) {
        return true;
    }
    let all_synced = future::join_all(barriers.iter().map(SyncBarrier::synced));
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!("cancelled while waiting for caches to sync");
            false
        }
        res = tokio::time::timeout(timeout, all_synced) => res.is_ok(),
    }
}
