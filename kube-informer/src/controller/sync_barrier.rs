use std::fmt;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Tracks whether the informer has drained its first full list
///
/// Starts out unsynced and flips to synced exactly once; it never reverts, not even when the
/// informer relists or stops. Clones observe the same flag.
#[derive(Clone, Default)]
pub struct SyncBarrier(CancellationToken);

impl fmt::Debug for SyncBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncBarrier").field(&self.has_synced()).finish()
    }
}

impl SyncBarrier {
    /// A new, unsynced barrier
    #[must_use]
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Whether the first full list has been drained
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the barrier has flipped
    pub fn synced(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }

    /// Flip the barrier, returning whether this call was the one that flipped it
    pub(crate) fn mark_synced(&self) -> bool {
        if self.0.is_cancelled() {
            return false;
        }
        self.0.cancel();
        debug!("sync barrier released");
        true
    }
}
