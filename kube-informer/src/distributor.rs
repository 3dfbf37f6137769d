//! Fans processed deltas out to registered handlers
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;

/// Error type returned by a failing [`ResourceEventHandler`]
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Receives the changes observed by an [`Informer`](crate::Informer)
///
/// Every entry point is invoked synchronously from the informer's drain loop, one delta at a
/// time and in order for any single identity. A slow handler delays every other handler,
/// so implementations must not block indefinitely. Errors and panics are caught and logged,
/// and never stop the informer.
pub trait ResourceEventHandler<K>: Send {
    /// An object was seen for the first time
    fn on_add(&mut self, obj: Arc<K>) -> Result<(), HandlerError>;

    /// A known object changed, or was replayed by a periodic resync
    ///
    /// During a resync `old` and `new` may be the same snapshot.
    fn on_update(&mut self, old: Arc<K>, new: Arc<K>) -> Result<(), HandlerError>;

    /// A known object was deleted; `obj` is its last known state
    fn on_delete(&mut self, obj: Arc<K>) -> Result<(), HandlerError>;
}

struct Listener<K> {
    handler: Box<dyn ResourceEventHandler<K>>,
    resync_period: Option<Duration>,
    next_resync: Option<Instant>,
    /// Whether this listener takes part in the resync generation currently being delivered
    resyncing: bool,
}

/// An ordered collection of handlers
///
/// Handlers are called in registration order, and each delta reaches every handler
/// before the next delta is distributed.
pub struct Distributor<K> {
    listeners: Vec<Listener<K>>,
    resync_check_period: Option<Duration>,
    resync_generation: Option<u64>,
}

impl<K> fmt::Debug for Distributor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distributor")
            .field("listeners", &self.listeners.len())
            .field("resync_check_period", &self.resync_check_period)
            .finish_non_exhaustive()
    }
}

impl<K> Distributor<K> {
    /// Create a distributor for an informer that replays its store every `resync_check_period`
    #[must_use]
    pub fn new(resync_check_period: Option<Duration>) -> Self {
        Self {
            listeners: Vec::new(),
            resync_check_period,
            resync_generation: None,
        }
    }

    /// Register a handler after any previously registered ones
    ///
    /// `resync_period` is how often the handler wants every cached object replayed through
    /// [`on_update`](ResourceEventHandler::on_update). It is raised to the informer's resync
    /// period if shorter; `None` or zero opts out of replays.
    pub fn register(&mut self, handler: Box<dyn ResourceEventHandler<K>>, resync_period: Option<Duration>) {
        let resync_period = match (resync_period.filter(|p| !p.is_zero()), self.resync_check_period) {
            (Some(wanted), Some(check)) => {
                if wanted < check {
                    tracing::warn!(
                        ?wanted,
                        ?check,
                        "handler resync period is shorter than the informer's, raising it"
                    );
                }
                Some(wanted.max(check))
            }
            (Some(wanted), None) => {
                tracing::warn!(?wanted, "informer does not resync, handler resync period ignored");
                None
            }
            (None, _) => None,
        };
        self.listeners.push(Listener {
            handler,
            next_resync: resync_period.map(|period| Instant::now() + period),
            resync_period,
            resyncing: false,
        });
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no handlers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver an addition to every handler
    pub fn notify_add(&mut self, obj: &Arc<K>) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            call_handler(idx, "on_add", || listener.handler.on_add(obj.clone()));
        }
    }

    /// Deliver an update to every handler
    pub fn notify_update(&mut self, old: &Arc<K>, new: &Arc<K>) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            call_handler(idx, "on_update", || {
                listener.handler.on_update(old.clone(), new.clone())
            });
        }
    }

    /// Deliver a deletion to every handler
    pub fn notify_delete(&mut self, obj: &Arc<K>) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            call_handler(idx, "on_delete", || listener.handler.on_delete(obj.clone()));
        }
    }

    /// Deliver a periodic replay to the handlers whose resync period has elapsed
    ///
    /// Which handlers are due is decided once per `generation`, so a replay reaches a
    /// handler for either all or none of the cached objects.
    pub fn notify_resync(&mut self, generation: u64, old: &Arc<K>, new: &Arc<K>) {
        if self.resync_generation != Some(generation) {
            self.resync_generation = Some(generation);
            let now = Instant::now();
            for listener in &mut self.listeners {
                listener.resyncing = match (listener.next_resync, listener.resync_period) {
                    (Some(next), Some(period)) if now >= next => {
                        listener.next_resync = Some(now + period);
                        true
                    }
                    _ => false,
                };
            }
            tracing::trace!(generation, "starting resync delivery");
        }
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if listener.resyncing {
                call_handler(idx, "on_update", || {
                    listener.handler.on_update(old.clone(), new.clone())
                });
            }
        }
    }

    /// Deliver the current cache contents to a single handler that joined late
    pub(crate) fn catch_up(&mut self, idx: usize, snapshot: &[Arc<K>]) {
        if let Some(listener) = self.listeners.get_mut(idx) {
            for obj in snapshot {
                call_handler(idx, "on_add", || listener.handler.on_add(obj.clone()));
            }
        }
    }
}

fn call_handler(idx: usize, entry_point: &'static str, f: impl FnOnce() -> Result<(), HandlerError>) {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::error!(handler = idx, entry_point, %error, "event handler failed");
        }
        Err(payload) => {
            tracing::error!(
                handler = idx,
                entry_point,
                panic = panic_message(payload.as_ref()),
                "event handler panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
mod tests {
    use super::Distributor;
    use crate::test_utils::{Notification, RecordingHandler, TestObj};
    use std::{sync::Arc, time::Duration};
    use tokio::time::advance;

    fn obj(name: &str, rv: &str) -> Arc<TestObj> {
        Arc::new(TestObj::new(name, rv))
    }

    #[tokio::test]
    async fn delivers_to_every_handler_in_order() {
        let first = RecordingHandler::default();
        let second = RecordingHandler::default();
        let mut distributor = Distributor::new(None);
        distributor.register(Box::new(first.clone()), None);
        distributor.register(Box::new(second.clone()), None);

        distributor.notify_add(&obj("a", "1"));
        distributor.notify_update(&obj("a", "1"), &obj("a", "2"));
        distributor.notify_delete(&obj("a", "2"));

        let expected = vec![
            Notification::Add(TestObj::new("a", "1")),
            Notification::Update(TestObj::new("a", "1"), TestObj::new("a", "2")),
            Notification::Delete(TestObj::new("a", "2")),
        ];
        assert_eq!(first.seen(), expected);
        assert_eq!(second.seen(), expected);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_the_others() {
        let failing = RecordingHandler {
            fail_on_add: true,
            panic_on_update: true,
            ..RecordingHandler::default()
        };
        let healthy = RecordingHandler::default();
        let mut distributor = Distributor::new(None);
        distributor.register(Box::new(failing.clone()), None);
        distributor.register(Box::new(healthy.clone()), None);

        distributor.notify_add(&obj("a", "1"));
        distributor.notify_update(&obj("a", "1"), &obj("a", "2"));
        distributor.notify_delete(&obj("a", "2"));

        assert_eq!(failing.seen().len(), 3);
        assert_eq!(healthy.seen(), vec![
            Notification::Add(TestObj::new("a", "1")),
            Notification::Update(TestObj::new("a", "1"), TestObj::new("a", "2")),
            Notification::Delete(TestObj::new("a", "2")),
        ]);
    }

    #[tokio::test]
    async fn resync_reaches_only_due_handlers() {
        tokio::time::pause();
        let fast = RecordingHandler::default();
        let slow = RecordingHandler::default();
        let deaf = RecordingHandler::default();
        let mut distributor = Distributor::new(Some(Duration::from_secs(10)));
        distributor.register(Box::new(fast.clone()), Some(Duration::from_secs(10)));
        distributor.register(Box::new(slow.clone()), Some(Duration::from_secs(30)));
        distributor.register(Box::new(deaf.clone()), None);
        let a = obj("a", "1");

        for generation in 1..=3 {
            advance(Duration::from_secs(10)).await;
            distributor.notify_resync(generation, &a, &a);
        }

        assert_eq!(fast.seen().len(), 3);
        assert_eq!(slow.seen(), vec![Notification::Update(
            TestObj::new("a", "1"),
            TestObj::new("a", "1")
        )]);
        assert!(deaf.seen().is_empty());
    }

    #[tokio::test]
    async fn resync_generation_is_delivered_whole() {
        tokio::time::pause();
        let handler = RecordingHandler::default();
        let mut distributor = Distributor::new(Some(Duration::from_secs(10)));
        distributor.register(Box::new(handler.clone()), Some(Duration::from_secs(10)));

        advance(Duration::from_secs(10)).await;
        distributor.notify_resync(1, &obj("a", "1"), &obj("a", "1"));
        // The handler is no longer due, but the generation already started
        distributor.notify_resync(1, &obj("b", "1"), &obj("b", "1"));
        distributor.notify_resync(2, &obj("a", "1"), &obj("a", "1"));

        assert_eq!(handler.seen().len(), 2);
    }

    #[tokio::test]
    async fn short_resync_periods_are_raised_to_the_check_period() {
        tokio::time::pause();
        let handler = RecordingHandler::default();
        let mut distributor = Distributor::new(Some(Duration::from_secs(60)));
        distributor.register(Box::new(handler.clone()), Some(Duration::from_secs(1)));

        advance(Duration::from_secs(30)).await;
        distributor.notify_resync(1, &obj("a", "1"), &obj("a", "1"));
        assert!(handler.seen().is_empty());

        advance(Duration::from_secs(30)).await;
        distributor.notify_resync(2, &obj("a", "1"), &obj("a", "1"));
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn catch_up_replays_snapshot_to_one_handler() {
        let early = RecordingHandler::default();
        let late = RecordingHandler::default();
        let mut distributor = Distributor::new(None);
        distributor.register(Box::new(early.clone()), None);
        distributor.register(Box::new(late.clone()), None);

        distributor.catch_up(1, &[obj("a", "1"), obj("b", "1")]);

        assert!(early.seen().is_empty());
        assert_eq!(late.seen(), vec![
            Notification::Add(TestObj::new("a", "1")),
            Notification::Add(TestObj::new("b", "1")),
        ]);
    }
}
