use anyhow::Context;
use std::{path::PathBuf, time::Duration};

/// Process settings, read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Path to the kubeconfig used to reach the cluster
    pub kubeconfig: PathBuf,
    /// Namespace to watch, or every namespace when unset
    pub namespace: Option<String>,
    /// How often the informer replays its cache
    pub resync_period: Duration,
    /// How often the logging handler wants the cache replayed
    pub handler_resync_period: Duration,
    /// How long to wait for the initial list before giving up
    pub cache_sync_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let kubeconfig = lookup("KUBECONFIG")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .context("KUBECONFIG environment variable must be set")?;
        Ok(Self {
            kubeconfig,
            namespace: lookup("NAMESPACE").filter(|ns| !ns.is_empty()),
            resync_period: seconds(&lookup, "RESYNC_PERIOD_SECS", 60)?,
            handler_resync_period: seconds(&lookup, "HANDLER_RESYNC_PERIOD_SECS", 60)?,
            cache_sync_timeout: seconds(&lookup, "CACHE_SYNC_TIMEOUT_SECS", 60)?,
        })
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> anyhow::Result<Duration> {
    let Some(raw) = lookup(key) else {
        return Ok(Duration::from_secs(default));
    };
    raw.trim()
        .parse()
        .map(Duration::from_secs)
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))
}
