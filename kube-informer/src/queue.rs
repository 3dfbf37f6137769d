//! An ordered, compressing buffer of deltas between the reflector and the drain loop
//!
//! The [`DeltaFifo`] decouples the rate at which the [`Reflector`](crate::reflector::Reflector)
//! observes changes from the rate at which handlers consume them. Deltas are delivered
//! first-in first-out across identities, while successive updates to the same identity
//! collapse into the newest one as long as they have not been popped yet.

use crate::{
    controller::SyncBarrier,
    reflector::{store::Store, Lookup, ObjectRef},
};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::sync::Notify;

/// The kind of change a [`Delta`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeltaType {
    /// The object was created
    Added,
    /// The object was modified, or replayed by a periodic resync
    Updated,
    /// The object was deleted
    Deleted,
    /// The object was enumerated by a full list
    Synced,
}

/// A single change to a single object
pub struct Delta<K> {
    /// What happened to the object
    pub type_: DeltaType,
    /// The object as of this change
    pub object: Arc<K>,
    /// The periodic resync generation that replayed this delta, if any
    pub resync: Option<u64>,
}

impl<K> Delta<K> {
    /// A delta observed from the remote API
    #[must_use]
    pub fn new(type_: DeltaType, object: Arc<K>) -> Self {
        Self {
            type_,
            object,
            resync: None,
        }
    }
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self {
            type_: self.type_,
            object: self.object.clone(),
            resync: self.resync,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Delta<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delta")
            .field("type", &self.type_)
            .field("object", &self.object)
            .field("resync", &self.resync)
            .finish()
    }
}

/// A delta taken off the front of a [`DeltaFifo`]
#[derive(Debug)]
pub struct Popped<K> {
    /// Identity of the object the delta applies to
    pub key: ObjectRef,
    /// The delta itself
    pub delta: Delta<K>,
    /// Whether this was the last outstanding delta of the first full list
    ///
    /// The consumer should flip the informer's [`SyncBarrier`] once it has processed it.
    pub completes_sync: bool,
}

struct Entry<K> {
    key: ObjectRef,
    delta: Delta<K>,
    initial: bool,
}

struct Fifo<K> {
    /// Pending entries, tagged with strictly increasing contiguous sequence numbers
    items: VecDeque<(u64, Entry<K>)>,
    /// Sequence number of the newest pending entry for each identity
    latest: AHashMap<ObjectRef, u64>,
    next_seq: u64,
    closed: bool,
    /// Whether the first full list has been enqueued
    populated: bool,
    /// Pending entries that belong to the first full list
    initial_population: usize,
    /// The delta handed out by the last pop, until the consumer reports it [done](DeltaFifo::done)
    ///
    /// The store does not reflect it yet, so it counts as the newest known state of its identity.
    processing: Option<(ObjectRef, Delta<K>)>,
}

impl<K> Default for Fifo<K> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            latest: AHashMap::new(),
            next_seq: 0,
            closed: false,
            populated: false,
            initial_population: 0,
            processing: None,
        }
    }
}

impl<K> Fifo<K> {
    fn pending(&self, key: &ObjectRef) -> Option<&Entry<K>> {
        let seq = *self.latest.get(key)?;
        let (front, _) = self.items.front()?;
        self.items.get(usize::try_from(seq - front).ok()?).map(|(_, entry)| entry)
    }

    /// The newest state of `key` that has not reached the store yet
    fn last_known(&self, key: &ObjectRef) -> Option<&Delta<K>> {
        match self.pending(key) {
            Some(entry) => Some(&entry.delta),
            None => self
                .processing
                .as_ref()
                .filter(|(processing, _)| processing == key)
                .map(|(_, delta)| delta),
        }
    }

    fn pending_mut(&mut self, key: &ObjectRef) -> Option<&mut Entry<K>> {
        let seq = *self.latest.get(key)?;
        let (front, _) = self.items.front()?;
        let idx = usize::try_from(seq - front).ok()?;
        self.items.get_mut(idx).map(|(_, entry)| entry)
    }

    fn enqueue(&mut self, key: ObjectRef, delta: Delta<K>, initial: bool) {
        if let Some(pending) = self.pending_mut(&key) {
            // Updates collapse into whatever comes next, other types must be observed
            if pending.delta.type_ == DeltaType::Updated
                && matches!(delta.type_, DeltaType::Updated | DeltaType::Deleted)
            {
                let counted = pending.initial;
                pending.delta = delta;
                pending.initial |= initial;
                if initial && !counted {
                    self.initial_population += 1;
                }
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.latest.insert(key.clone(), seq);
        self.items.push_back((seq, Entry { key, delta, initial }));
        if initial {
            self.initial_population += 1;
        }
    }

    fn pop_front(&mut self) -> Option<Popped<K>> {
        let (seq, entry) = self.items.pop_front()?;
        if self.latest.get(&entry.key) == Some(&seq) {
            self.latest.remove(&entry.key);
        }
        self.processing = Some((entry.key.clone(), entry.delta.clone()));
        let completes_sync = if entry.initial {
            self.initial_population -= 1;
            self.initial_population == 0
        } else {
            false
        };
        Some(Popped {
            key: entry.key,
            delta: entry.delta,
            completes_sync,
        })
    }
}

/// A FIFO of [`Delta`]s with per-identity update compression
///
/// There is a single consumer (the drain loop, through [`pop`](Self::pop)) and a single
/// producer (the reflector). All mutations, compression included, happen under one lock
/// that is never held across an `.await`.
pub struct DeltaFifo<K: 'static> {
    fifo: Mutex<Fifo<K>>,
    notify: Notify,
    known_objects: Store<K>,
    synced: SyncBarrier,
}

impl<K: 'static> fmt::Debug for DeltaFifo<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fifo = self.fifo.lock();
        f.debug_struct("DeltaFifo")
            .field("len", &fifo.items.len())
            .field("closed", &fifo.closed)
            .field("populated", &fifo.populated)
            .finish_non_exhaustive()
    }
}

impl<K: Lookup + 'static> DeltaFifo<K> {
    /// Create an empty queue
    ///
    /// `known_objects` is the store the consumer maintains, used to find identities that
    /// vanished during a relist and objects to replay during a resync. `synced` is flipped
    /// directly when the first full list turns out to be empty.
    #[must_use]
    pub fn new(known_objects: Store<K>, synced: SyncBarrier) -> Self {
        Self {
            fifo: Mutex::new(Fifo::default()),
            notify: Notify::new(),
            known_objects,
            synced,
        }
    }

    /// Enqueue a delta
    ///
    /// A pending `Updated` delta for the same identity is replaced in place by an incoming
    /// `Updated` or `Deleted` delta. Anything else is appended. Pushing to a closed queue is a no-op.
    pub fn push(&self, delta: Delta<K>) {
        let key = delta.object.to_object_ref();
        {
            let mut fifo = self.fifo.lock();
            if fifo.closed {
                tracing::trace!(%key, "queue closed, dropping delta");
                return;
            }
            fifo.enqueue(key, delta, false);
        }
        self.notify.notify_one();
    }

    /// Take the oldest pending delta, waiting for one to arrive
    ///
    /// Returns `None` once the queue is closed and fully drained.
    /// Cancel safe: a delta is only removed when this future resolves.
    ///
    /// Until the consumer calls [`done`](Self::done), the popped delta is still treated as the
    /// newest state of its identity by [`replace`](Self::replace) and [`resync`](Self::resync).
    pub async fn pop(&self) -> Option<Popped<K>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut fifo = self.fifo.lock();
                if let Some(popped) = fifo.pop_front() {
                    return Some(popped);
                }
                if fifo.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Enqueue the result of a full list
    ///
    /// Every listed object is enqueued as a [`DeltaType::Synced`] delta. Identities that are
    /// known (cached or still pending) but absent from `objects` are enqueued as
    /// [`DeltaType::Deleted`] with their last known state.
    ///
    /// The first call defines the initial population that gates the informer's sync barrier.
    pub fn replace(&self, objects: Vec<K>) {
        {
            let mut fifo = self.fifo.lock();
            if fifo.closed {
                return;
            }
            let initial = !fifo.populated;
            let mut listed = AHashSet::with_capacity(objects.len());
            for obj in objects {
                let key = obj.to_object_ref();
                listed.insert(key.clone());
                fifo.enqueue(key, Delta::new(DeltaType::Synced, Arc::new(obj)), initial);
            }

            let mut retired = Vec::new();
            for key in self.known_objects.keys() {
                if listed.contains(&key) {
                    continue;
                }
                let last_known = match fifo.last_known(&key) {
                    Some(delta) if delta.type_ == DeltaType::Deleted => continue,
                    Some(delta) => Some(delta.object.clone()),
                    None => self.known_objects.get(&key),
                };
                if let Some(obj) = last_known {
                    retired.push((key, obj));
                }
            }
            // Identities that are pending or being processed, but not cached yet
            let mut uncached = fifo.latest.keys().cloned().collect::<Vec<_>>();
            if let Some((key, _)) = &fifo.processing {
                if !fifo.latest.contains_key(key) {
                    uncached.push(key.clone());
                }
            }
            for key in uncached {
                if listed.contains(&key) || self.known_objects.contains(&key) {
                    continue;
                }
                match fifo.last_known(&key) {
                    Some(delta) if delta.type_ != DeltaType::Deleted => {
                        let obj = delta.object.clone();
                        retired.push((key, obj));
                    }
                    _ => {}
                }
            }
            for (key, obj) in retired {
                tracing::debug!(%key, "object vanished during relist, retiring");
                fifo.enqueue(key, Delta::new(DeltaType::Deleted, obj), initial);
            }

            if initial {
                fifo.populated = true;
                if fifo.initial_population == 0 && self.synced.mark_synced() {
                    tracing::debug!("initial list is empty, synced");
                }
            }
        }
        self.notify.notify_one();
    }

    /// Replay every cached object as an [`DeltaType::Updated`] delta tagged with `generation`
    ///
    /// Identities with a pending delta, or whose popped delta is still being processed, are skipped:
    /// the store is about to change for them.
    /// Returns the number of deltas enqueued.
    pub fn resync(&self, generation: u64) -> usize {
        let mut replayed = 0;
        {
            let mut fifo = self.fifo.lock();
            if fifo.closed {
                return 0;
            }
            for obj in self.known_objects.state() {
                let key = obj.to_object_ref();
                if fifo.last_known(&key).is_some() {
                    continue;
                }
                let delta = Delta {
                    type_: DeltaType::Updated,
                    object: obj,
                    resync: Some(generation),
                };
                fifo.enqueue(key, delta, false);
                replayed += 1;
            }
        }
        if replayed > 0 {
            self.notify.notify_one();
        }
        replayed
    }

    /// Report that the delta popped for `key` has been applied to the store
    pub fn done(&self, key: &ObjectRef) {
        let mut fifo = self.fifo.lock();
        if fifo.processing.as_ref().is_some_and(|(processing, _)| processing == key) {
            fifo.processing = None;
        }
    }

    /// Stop accepting deltas
    ///
    /// Deltas already queued are still handed out by [`pop`](Self::pop), after which it returns `None`.
    pub fn close(&self) {
        self.fifo.lock().closed = true;
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.fifo.lock().closed
    }

    /// Number of pending deltas
    pub fn len(&self) -> usize {
        self.fifo.lock().items.len()
    }

    /// Whether there are no pending deltas
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Delta, DeltaFifo, DeltaType};
    use crate::{
        controller::SyncBarrier,
        reflector::{store::Writer, ObjectRef},
        test_utils::TestObj,
    };
    use futures::{pin_mut, poll};
    use std::{sync::Arc, task::Poll};

    fn delta(type_: DeltaType, name: &str, rv: &str) -> Delta<TestObj> {
        Delta::new(type_, Arc::new(TestObj::new(name, rv)))
    }

    fn fifo() -> (Writer<TestObj>, SyncBarrier, DeltaFifo<TestObj>) {
        let writer = Writer::default();
        let synced = SyncBarrier::new();
        let queue = DeltaFifo::new(writer.as_reader(), synced.clone());
        (writer, synced, queue)
    }

    async fn drain(queue: &DeltaFifo<TestObj>) -> Vec<(DeltaType, String, String)> {
        queue.close();
        let mut out = Vec::new();
        while let Some(popped) = queue.pop().await {
            let obj = &popped.delta.object;
            out.push((popped.delta.type_, obj.name.clone(), obj.resource_version.clone()));
            queue.done(&popped.key);
        }
        out
    }

    fn seen(type_: DeltaType, name: &str, rv: &str) -> (DeltaType, String, String) {
        (type_, name.to_string(), rv.to_string())
    }

    #[tokio::test]
    async fn pops_distinct_identities_in_push_order() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Added, "b", "1"));
        queue.push(delta(DeltaType::Added, "a", "2"));
        queue.push(delta(DeltaType::Updated, "c", "3"));
        assert_eq!(drain(&queue).await, vec![
            seen(DeltaType::Added, "b", "1"),
            seen(DeltaType::Added, "a", "2"),
            seen(DeltaType::Updated, "c", "3"),
        ]);
    }

    #[tokio::test]
    async fn successive_updates_collapse_into_the_latest() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Updated, "a", "1"));
        queue.push(delta(DeltaType::Added, "b", "1"));
        queue.push(delta(DeltaType::Updated, "a", "2"));
        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&queue).await, vec![
            seen(DeltaType::Updated, "a", "2"),
            seen(DeltaType::Added, "b", "1"),
        ]);
    }

    #[tokio::test]
    async fn added_is_never_compressed_away() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Added, "a", "1"));
        queue.push(delta(DeltaType::Updated, "a", "2"));
        queue.push(delta(DeltaType::Updated, "a", "3"));
        assert_eq!(drain(&queue).await, vec![
            seen(DeltaType::Added, "a", "1"),
            seen(DeltaType::Updated, "a", "3"),
        ]);
    }

    #[tokio::test]
    async fn deletion_replaces_pending_update() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Updated, "a", "1"));
        queue.push(delta(DeltaType::Deleted, "a", "2"));
        queue.push(delta(DeltaType::Deleted, "b", "1"));
        assert_eq!(drain(&queue).await, vec![
            seen(DeltaType::Deleted, "a", "2"),
            seen(DeltaType::Deleted, "b", "1"),
        ]);
    }

    #[tokio::test]
    async fn compression_only_applies_to_pending_entries() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Updated, "a", "1"));
        assert!(queue.pop().await.is_some());
        queue.push(delta(DeltaType::Updated, "a", "2"));
        queue.push(delta(DeltaType::Updated, "a", "3"));
        assert_eq!(drain(&queue).await, vec![seen(DeltaType::Updated, "a", "3")]);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Added, "a", "1"));
        queue.close();
        queue.push(delta(DeltaType::Added, "b", "1"));
        assert!(queue.is_closed());
        assert_eq!(queue.pop().await.map(|p| p.key), Some(ObjectRef::new("a")));
        assert!(queue.pop().await.is_none());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let (_, _, queue) = fifo();
        let pop = queue.pop();
        pin_mut!(pop);
        assert!(poll!(pop.as_mut()).is_pending());
        queue.push(delta(DeltaType::Added, "a", "1"));
        match poll!(pop.as_mut()) {
            Poll::Ready(Some(popped)) => assert_eq!(popped.key, ObjectRef::new("a")),
            other => panic!("expected a delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_pop() {
        let (_, _, queue) = fifo();
        let pop = queue.pop();
        pin_mut!(pop);
        assert!(poll!(pop.as_mut()).is_pending());
        queue.close();
        assert!(matches!(poll!(pop.as_mut()), Poll::Ready(None)));
    }

    #[tokio::test]
    async fn last_initial_delta_completes_sync() {
        let (_, synced, queue) = fifo();
        queue.replace(vec![TestObj::new("a", "1"), TestObj::new("b", "1")]);
        queue.push(delta(DeltaType::Added, "c", "2"));
        assert!(!synced.has_synced());

        let first = queue.pop().await.unwrap();
        assert_eq!(first.delta.type_, DeltaType::Synced);
        assert!(!first.completes_sync);
        let second = queue.pop().await.unwrap();
        assert_eq!(second.key, ObjectRef::new("b"));
        assert!(second.completes_sync);
        let third = queue.pop().await.unwrap();
        assert!(!third.completes_sync);
        // The queue leaves flipping the barrier to the consumer
        assert!(!synced.has_synced());
    }

    #[tokio::test]
    async fn empty_initial_list_syncs_immediately() {
        let (_, synced, queue) = fifo();
        queue.replace(Vec::new());
        assert!(synced.has_synced());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn relist_retires_vanished_identities() {
        let (mut writer, _, queue) = fifo();
        for obj in [TestObj::new("a", "1"), TestObj::new("b", "1")] {
            writer.update(ObjectRef::from_obj(&obj), Arc::new(obj));
        }
        queue.push(delta(DeltaType::Added, "pending", "2"));

        queue.replace(vec![TestObj::new("a", "3")]);
        let mut out = drain(&queue).await;
        out.sort();
        let mut expected = vec![
            seen(DeltaType::Added, "pending", "2"),
            seen(DeltaType::Synced, "a", "3"),
            seen(DeltaType::Deleted, "b", "1"),
            seen(DeltaType::Deleted, "pending", "2"),
        ];
        expected.sort();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn relist_does_not_retire_twice() {
        let (mut writer, _, queue) = fifo();
        let b = TestObj::new("b", "1");
        writer.update(ObjectRef::from_obj(&b), Arc::new(b));
        queue.push(delta(DeltaType::Deleted, "b", "2"));
        queue.replace(Vec::new());
        assert_eq!(drain(&queue).await, vec![seen(DeltaType::Deleted, "b", "2")]);
    }

    #[tokio::test]
    async fn resync_replays_cached_objects_without_pending_deltas() {
        let (mut writer, _, queue) = fifo();
        for obj in [TestObj::new("a", "1"), TestObj::new("b", "1")] {
            writer.update(ObjectRef::from_obj(&obj), Arc::new(obj));
        }
        queue.push(delta(DeltaType::Updated, "b", "2"));
        assert_eq!(queue.resync(7), 1);

        queue.close();
        let first = queue.pop().await.unwrap();
        assert_eq!(first.key, ObjectRef::new("b"));
        assert_eq!(first.delta.resync, None);
        let second = queue.pop().await.unwrap();
        assert_eq!(second.key, ObjectRef::new("a"));
        assert_eq!(second.delta.type_, DeltaType::Updated);
        assert_eq!(second.delta.resync, Some(7));
    }

    #[tokio::test]
    async fn real_update_supersedes_resync_replay() {
        let (mut writer, _, queue) = fifo();
        let a = TestObj::new("a", "1");
        writer.update(ObjectRef::from_obj(&a), Arc::new(a));
        queue.resync(1);
        queue.push(delta(DeltaType::Updated, "a", "2"));
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.delta.resync, None);
        assert_eq!(popped.delta.object.resource_version, "2");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn resync_skips_identity_being_processed() {
        let (mut writer, _, queue) = fifo();
        let a = TestObj::new("a", "1");
        writer.update(ObjectRef::from_obj(&a), Arc::new(a));
        queue.push(delta(DeltaType::Updated, "a", "2"));

        let popped = queue.pop().await.unwrap();
        assert_eq!(queue.resync(1), 0, "store still holds the version being replaced");
        queue.done(&popped.key);
        assert_eq!(queue.resync(2), 1);
    }

    #[tokio::test]
    async fn relist_retires_identity_being_processed() {
        let (_, _, queue) = fifo();
        queue.push(delta(DeltaType::Added, "c", "5"));
        let popped = queue.pop().await.unwrap();

        queue.replace(Vec::new());
        queue.done(&popped.key);
        assert_eq!(drain(&queue).await, vec![seen(DeltaType::Deleted, "c", "5")]);
    }

    #[tokio::test]
    async fn relist_does_not_retire_identity_being_deleted() {
        let (mut writer, _, queue) = fifo();
        let b = TestObj::new("b", "1");
        writer.update(ObjectRef::from_obj(&b), Arc::new(b));
        queue.push(delta(DeltaType::Deleted, "b", "2"));
        let _popped = queue.pop().await.unwrap();

        queue.replace(Vec::new());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn done_only_releases_the_matching_identity() {
        let (mut writer, _, queue) = fifo();
        let a = TestObj::new("a", "1");
        writer.update(ObjectRef::from_obj(&a), Arc::new(a));
        queue.push(delta(DeltaType::Updated, "a", "2"));
        let _popped = queue.pop().await.unwrap();

        queue.done(&ObjectRef::new("other"));
        assert_eq!(queue.resync(1), 0);
    }
}
