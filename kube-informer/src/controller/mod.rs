//! Runs the reflector and drains its deltas into the store and the registered handlers

mod sync_barrier;

pub use sync_barrier::SyncBarrier;

use crate::{
    distributor::{Distributor, ResourceEventHandler},
    queue::{Delta, DeltaFifo, DeltaType, Popped},
    reflector::{Lookup, ObjectRef, Reflector, Store, Writer},
    utils::DefaultBackoff,
    watcher::ListerWatcher,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Errors returned by [`Informer::run`] and [`InformerHandle::add_handler`]
#[derive(Debug, Error)]
pub enum Error {
    /// The informer has already been started once
    #[error("informer is already running or has already run")]
    AlreadyRunning,

    /// The informer has stopped and no longer accepts handlers
    #[error("informer has stopped")]
    Stopped,

    /// The reflector task panicked or was aborted
    #[error("reflector task failed: {0}")]
    ReflectorPanicked(#[source] tokio::task::JoinError),
}

/// The states an [`Informer`] moves through, in order
///
/// There is no way back from [`Lifecycle::Stopping`] or [`Lifecycle::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, [`Informer::run`] not called yet
    Created,
    /// Listing, watching and delivering deltas
    Running,
    /// Cancelled, delivering the deltas that were already queued
    Stopping,
    /// The queue is drained and the reflector has exited
    Stopped,
}

/// Informer configuration
#[derive(Clone, Debug)]
pub struct InformerConfig {
    /// How often every cached object is replayed to the handlers
    ///
    /// `None` disables periodic replays entirely, whatever the handlers ask for.
    pub resync_period: Option<Duration>,

    /// Backoff between failed list and watch attempts
    pub backoff: DefaultBackoff,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(60)),
            backoff: DefaultBackoff::default(),
        }
    }
}

impl InformerConfig {
    /// Replay every cached object every `period`
    ///
    /// A zero period disables replays.
    #[must_use]
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period).filter(|p| !p.is_zero());
        self
    }

    /// Never replay cached objects
    #[must_use]
    pub fn disable_resync(mut self) -> Self {
        self.resync_period = None;
        self
    }

    /// Retry failed lists and watches after `min`, doubling up to `max`
    #[must_use]
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff = DefaultBackoff::new(min, max);
        self
    }
}

struct Registration<K> {
    handler: Box<dyn ResourceEventHandler<K>>,
    resync_period: Option<Duration>,
}

/// Everything [`Informer::run`] takes ownership of when it starts
struct Parts<K: 'static, L> {
    lister_watcher: L,
    writer: Writer<K>,
    distributor: Distributor<K>,
    registrations: mpsc::UnboundedReceiver<Registration<K>>,
}

/// A cheap, cloneable view onto a running [`Informer`]
pub struct InformerHandle<K: 'static> {
    store: Store<K>,
    synced: SyncBarrier,
    registrations: mpsc::UnboundedSender<Registration<K>>,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl<K: 'static> Clone for InformerHandle<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
            registrations: self.registrations.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<K: 'static> fmt::Debug for InformerHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InformerHandle")
            .field("store", &self.store)
            .field("synced", &self.synced.has_synced())
            .field("lifecycle", &*self.lifecycle.borrow())
            .finish()
    }
}

impl<K: 'static> InformerHandle<K> {
    /// Read access to the informer's cache
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Whether the first full list has been delivered
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.synced.has_synced()
    }

    /// The barrier behind [`has_synced`](Self::has_synced), for waiting on it
    #[must_use]
    pub fn sync_barrier(&self) -> SyncBarrier {
        self.synced.clone()
    }

    /// Where the informer currently is in its [`Lifecycle`]
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Register a handler, see [`Informer::add_handler`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] if the informer has already stopped.
    pub fn add_handler(
        &self,
        handler: impl ResourceEventHandler<K> + 'static,
        resync_period: Option<Duration>,
    ) -> Result<(), Error> {
        self.registrations
            .send(Registration {
                handler: Box::new(handler),
                resync_period,
            })
            .map_err(|_| Error::Stopped)
    }
}

/// A list-watch-cache engine for one kind of object
///
/// The informer keeps a [`Store`] in sync with the remote collection behind its
/// [`ListerWatcher`] and tells every registered [`ResourceEventHandler`] about each change.
///
/// Two activities run side by side once [`run`](Self::run) is called: the [`Reflector`]
/// pushes deltas into a [`DeltaFifo`], and the drain loop pops them, applies them to the store,
/// and hands them to the [`Distributor`]. The drain loop is the only writer of the store.
///
/// ```no_run
/// # use kube_informer::{controller::{Informer, InformerConfig}, watcher::ListerWatcher};
/// # use kube_informer::{distributor::{HandlerError, ResourceEventHandler}, reflector::Lookup};
/// # use std::sync::Arc;
/// # use tokio_util::sync::CancellationToken;
/// # struct Printer;
/// # impl<K: Lookup> ResourceEventHandler<K> for Printer {
/// #     fn on_add(&mut self, obj: Arc<K>) -> Result<(), HandlerError> { Ok(()) }
/// #     fn on_update(&mut self, old: Arc<K>, new: Arc<K>) -> Result<(), HandlerError> { Ok(()) }
/// #     fn on_delete(&mut self, obj: Arc<K>) -> Result<(), HandlerError> { Ok(()) }
/// # }
/// # async fn wrapper<K, L>(lister_watcher: L) -> Result<(), Box<dyn std::error::Error>>
/// # where K: Lookup + Send + Sync + 'static, L: ListerWatcher<K> + 'static {
/// let informer: Informer<K, L> = Informer::new(lister_watcher, InformerConfig::default());
/// informer.add_handler(Printer, None)?;
/// let cancel = CancellationToken::new();
/// informer.run(cancel).await?;
/// # Ok(())
/// # }
/// ```
pub struct Informer<K: 'static, L> {
    parts: Mutex<Option<Parts<K, L>>>,
    queue: Arc<DeltaFifo<K>>,
    config: InformerConfig,
    lifecycle: watch::Sender<Lifecycle>,
    handle: InformerHandle<K>,
}

impl<K: 'static, L> fmt::Debug for Informer<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<K, L> Informer<K, L>
where
    K: Lookup + Send + Sync + 'static,
    L: ListerWatcher<K> + 'static,
{
    /// Create an informer over `lister_watcher`
    #[must_use]
    pub fn new(lister_watcher: L, config: InformerConfig) -> Self {
        let writer = Writer::default();
        let synced = SyncBarrier::new();
        let queue = Arc::new(DeltaFifo::new(writer.as_reader(), synced.clone()));
        let (registration_tx, registration_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Created);
        let handle = InformerHandle {
            store: writer.as_reader(),
            synced,
            registrations: registration_tx,
            lifecycle: lifecycle_rx,
        };
        Self {
            parts: Mutex::new(Some(Parts {
                lister_watcher,
                writer,
                distributor: Distributor::new(config.resync_period),
                registrations: registration_rx,
            })),
            queue,
            config,
            lifecycle: lifecycle_tx,
            handle,
        }
    }

    /// Register a handler
    ///
    /// Handlers are called in registration order. A handler registered while the informer is
    /// running first receives every cached object through `on_add`, then the changes that follow.
    ///
    /// `resync_period` asks for every cached object to be replayed through `on_update` that often.
    /// It is raised to the informer's resync period when shorter; `None` opts out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] if the informer has already stopped.
    pub fn add_handler(
        &self,
        handler: impl ResourceEventHandler<K> + 'static,
        resync_period: Option<Duration>,
    ) -> Result<(), Error> {
        self.handle.add_handler(handler, resync_period)
    }

    /// A handle that stays usable while [`run`](Self::run) is borrowing the informer
    #[must_use]
    pub fn handle(&self) -> InformerHandle<K> {
        self.handle.clone()
    }

    /// Read access to the cache
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.handle.store()
    }

    /// Whether the first full list has been delivered
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.handle.has_synced()
    }

    /// Run until `cancel` fires and every queued delta has been delivered
    ///
    /// Cancellation stops the reflector and closes the queue. Deltas that were already queued
    /// are still applied and delivered before this returns, none are dropped mid-way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] when called a second time, and
    /// [`Error::ReflectorPanicked`] if the reflector task died.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let parts = self.parts.lock().take();
        let Some(parts) = parts else {
            return Err(Error::AlreadyRunning);
        };
        let Parts {
            lister_watcher,
            writer,
            distributor,
            mut registrations,
        } = parts;
        self.lifecycle.send_replace(Lifecycle::Running);
        info!(resync_period = ?self.config.resync_period, "starting informer");

        let reflector_cancel = cancel.child_token();
        let reflector = Reflector::new(lister_watcher, self.queue.clone())
            .resync_period(self.config.resync_period)
            .backoff(self.config.backoff.clone());
        let reflector = tokio::spawn(reflector.run(reflector_cancel.clone()));

        let mut drain = Drain {
            writer,
            distributor,
            synced: self.handle.synced.clone(),
            queue: self.queue.clone(),
        };
        let stop = cancel.cancelled();
        tokio::pin!(stop);
        loop {
            tokio::select! {
                biased;
                () = &mut stop, if !self.queue.is_closed() => {
                    info!(pending = self.queue.len(), "stopping informer");
                    self.lifecycle.send_replace(Lifecycle::Stopping);
                    reflector_cancel.cancel();
                    self.queue.close();
                }
                Some(registration) = registrations.recv() => drain.register(registration),
                popped = self.queue.pop() => match popped {
                    Some(popped) => drain.process(popped),
                    None => break,
                },
            }
        }

        let reflector = reflector.await.map_err(Error::ReflectorPanicked);
        self.lifecycle.send_replace(Lifecycle::Stopped);
        info!("informer stopped");
        reflector
    }
}

/// The drain loop's exclusive state
struct Drain<K: 'static> {
    writer: Writer<K>,
    distributor: Distributor<K>,
    synced: SyncBarrier,
    queue: Arc<DeltaFifo<K>>,
}

impl<K: Lookup + 'static> Drain<K> {
    fn register(&mut self, registration: Registration<K>) {
        self.distributor
            .register(registration.handler, registration.resync_period);
        let snapshot = self.writer.as_reader().state();
        if !snapshot.is_empty() {
            debug!(objects = snapshot.len(), "catching up late handler");
            self.distributor.catch_up(self.distributor.len() - 1, &snapshot);
        }
    }

    /// Apply one delta to the store and tell the handlers about it
    ///
    /// The queue is told the delta is done once the store reflects it.
    fn process(&mut self, popped: Popped<K>) {
        let Popped {
            key,
            delta,
            completes_sync,
        } = popped;
        trace!(%key, type_ = ?delta.type_, resync = ?delta.resync, "processing delta");
        self.apply(key.clone(), delta);
        self.queue.done(&key);
        if completes_sync && self.synced.mark_synced() {
            info!("initial list delivered, cache synced");
        }
    }

    fn apply(&mut self, key: ObjectRef, delta: Delta<K>) {
        let obj = delta.object;
        match delta.type_ {
            DeltaType::Deleted => match self.writer.delete(&key) {
                Some(last_known) => self.distributor.notify_delete(&last_known),
                None => trace!(%key, "deletion of an object that was never delivered, skipping"),
            },
            DeltaType::Updated if delta.resync.is_some() && !self.writer.as_reader().contains(&key) => {
                trace!(%key, "replay of an object that is no longer cached, skipping");
            }
            DeltaType::Synced => match self.writer.update(key, obj.clone()) {
                None => self.distributor.notify_add(&obj),
                Some(old) if same_version(old.as_ref(), obj.as_ref()) => {}
                Some(old) => self.distributor.notify_update(&old, &obj),
            },
            DeltaType::Added | DeltaType::Updated => match (self.writer.update(key, obj.clone()), delta.resync) {
                (None, _) => self.distributor.notify_add(&obj),
                (Some(old), Some(generation)) => self.distributor.notify_resync(generation, &old, &obj),
                (Some(old), None) => self.distributor.notify_update(&old, &obj),
            },
        }
    }
}

fn same_version<K: Lookup>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}
