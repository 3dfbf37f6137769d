//! Reflects remote state into the informer's delta queue

mod object_ref;
pub mod store;

pub use self::object_ref::{Lookup, ObjectRef};
pub use store::{Store, Writer};

use crate::{
    queue::{Delta, DeltaFifo, DeltaType},
    utils::{DefaultBackoff, ResettableBackoff, ResettableBackoffWrapper},
    watcher::{Error, ListerWatcher, Result, WatchEvent, WatchStream},
};
use backon::ExponentialBuilder;
use futures::StreamExt;
use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// The internal finite state machine driving the [`Reflector`]
enum State<K> {
    /// The next step performs a full LIST to get all existing objects
    Empty,
    /// The LIST (or a previous watch) succeeded, so we should move on to (re)starting the watch
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just forward events from the server
    ///
    /// If the connection is disrupted then we restart the watch from the last seen resource version
    /// by returning to the `InitListed` state.
    /// If we fall out of the watch window then we fall back to doing a re-list with `Empty`.
    Watching {
        resource_version: String,
        stream: WatchStream<K>,
    },
}

impl<K> fmt::Debug for State<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Empty => f.write_str("Empty"),
            State::InitListed { resource_version } => f
                .debug_struct("InitListed")
                .field("resource_version", resource_version)
                .finish(),
            State::Watching { resource_version, .. } => f
                .debug_struct("Watching")
                .field("resource_version", resource_version)
                .finish_non_exhaustive(),
        }
    }
}

/// Turns a [`ListerWatcher`] into a stream of [`Delta`]s pushed into a [`DeltaFifo`]
///
/// On start (and whenever the resume token expires) it lists the whole collection and
/// hands it to [`DeltaFifo::replace`], then watches from the collection's resource version.
/// Watch events become `Added`/`Updated`/`Deleted` deltas.
///
/// # Recovery
///
/// If the watch ends or the connection is interrupted, the watch is restarted from the last
/// resource version seen on the stream (bookmarks included). If the resource version is no
/// longer valid, the token is discarded and a fresh list is performed, which retires every
/// identity that disappeared in the meantime.
///
/// Failed lists and watches are retried with a capped exponential backoff. No error is ever
/// fatal to the reflector; it only stops when cancelled.
///
/// # Resync
///
/// With a resync period, the cached objects are replayed through [`DeltaFifo::resync`] on a
/// timer of their own, whether the reflector is listing, watching or backing off.
pub struct Reflector<K: 'static, L> {
    lister_watcher: L,
    queue: Arc<DeltaFifo<K>>,
    resync_period: Option<Duration>,
    backoff: ResettableBackoffWrapper<ExponentialBuilder>,
    _phantom: PhantomData<fn(K)>,
}

impl<K: 'static, L> fmt::Debug for Reflector<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reflector")
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl<K, L> Reflector<K, L>
where
    K: Lookup + Send + Sync + 'static,
    L: ListerWatcher<K>,
{
    /// Create a reflector feeding `queue` from `lister_watcher`
    #[must_use]
    pub fn new(lister_watcher: L, queue: Arc<DeltaFifo<K>>) -> Self {
        Self {
            lister_watcher,
            queue,
            resync_period: None,
            backoff: DefaultBackoff::default().resettable(),
            _phantom: PhantomData,
        }
    }

    /// Replay the cached objects every `period`
    #[must_use]
    pub fn resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }

    /// Use `backoff` between failed attempts
    #[must_use]
    pub fn backoff(mut self, backoff: DefaultBackoff) -> Self {
        self.backoff = backoff.resettable();
        self
    }

    /// Drive list and watch until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(resync_period = ?self.resync_period, "starting reflector");
        let resync = resync_periodically(self.queue.clone(), self.resync_period);
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            () = resync => {}
            () = self.list_watch() => {}
        }
        debug!("reflector stopped");
    }

    /// Step through the state machine forever, backing off after failures
    async fn list_watch(&mut self) {
        let mut state = State::Empty;
        loop {
            match self.step(&mut state).await {
                Ok(()) => self.backoff.reset(),
                Err(error) => {
                    if let Some(delay) = self.backoff.next() {
                        warn!(%error, ?delay, state = ?state, "list/watch failed, backing off");
                        time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Progresses the reflector a single step
    async fn step(&mut self, state: &mut State<K>) -> Result<()> {
        match state {
            State::Empty => {
                let list = self.lister_watcher.list().await?;
                let resource_version = list.resource_version.ok_or(Error::MissingResourceVersion)?;
                info!(
                    objects = list.items.len(),
                    %resource_version,
                    "listed collection"
                );
                self.queue.replace(list.items);
                *state = State::InitListed { resource_version };
                Ok(())
            }
            State::InitListed { resource_version } => {
                match self.lister_watcher.watch(resource_version).await {
                    Ok(stream) => {
                        debug!(%resource_version, "watch started");
                        *state = State::Watching {
                            resource_version: std::mem::take(resource_version),
                            stream,
                        };
                        Ok(())
                    }
                    Err(error) if error.is_expired() => {
                        info!(%resource_version, "resume token expired, relisting");
                        *state = State::Empty;
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            State::Watching {
                resource_version,
                stream,
            } => {
                let event = stream.next().await;
                match event {
                    Some(Ok(WatchEvent::Added(obj))) => self.forward(DeltaType::Added, obj, resource_version),
                    Some(Ok(WatchEvent::Modified(obj))) => {
                        self.forward(DeltaType::Updated, obj, resource_version);
                    }
                    Some(Ok(WatchEvent::Deleted(obj))) => {
                        self.forward(DeltaType::Deleted, obj, resource_version);
                    }
                    Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                        trace!(resource_version = %bookmark, "bookmark");
                        *resource_version = bookmark;
                    }
                    Some(Ok(WatchEvent::Error(response))) if response.is_expired() => {
                        info!(%resource_version, reason = %response.reason, "watch expired, relisting");
                        *state = State::Empty;
                    }
                    Some(Ok(WatchEvent::Error(response))) => {
                        *state = State::InitListed {
                            resource_version: std::mem::take(resource_version),
                        };
                        return Err(Error::Api(response));
                    }
                    Some(Err(error)) if error.is_expired() => {
                        info!(%resource_version, %error, "watch expired, relisting");
                        *state = State::Empty;
                    }
                    Some(Err(error)) => {
                        *state = State::InitListed {
                            resource_version: std::mem::take(resource_version),
                        };
                        return Err(error);
                    }
                    None => {
                        debug!(%resource_version, "watch stream ended, reconnecting");
                        *state = State::InitListed {
                            resource_version: std::mem::take(resource_version),
                        };
                    }
                }
                Ok(())
            }
        }
    }

    fn forward(&self, type_: DeltaType, obj: K, resource_version: &mut String) {
        if let Some(rv) = obj.resource_version() {
            *resource_version = rv.into_owned();
        }
        trace!(?type_, key = %obj.to_object_ref(), "forwarding delta");
        self.queue.push(Delta::new(type_, Arc::new(obj)));
    }
}

/// Replay the store into `queue` every `period`, or never without one
async fn resync_periodically<K: Lookup + 'static>(queue: Arc<DeltaFifo<K>>, period: Option<Duration>) {
    let Some(period) = period else {
        return futures::future::pending().await;
    };
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut generation = 0;
    loop {
        interval.tick().await;
        generation += 1;
        let replayed = queue.resync(generation);
        debug!(generation, replayed, "resync");
    }
}
