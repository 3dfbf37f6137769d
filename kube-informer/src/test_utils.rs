//! Scripted transport and recording handlers shared by the unit tests
use crate::{
    distributor::{HandlerError, ResourceEventHandler},
    reflector::{Lookup, ObjectRef},
    watcher::{Error, ErrorResponse, ListerWatcher, ObjectList, Result, WatchEvent, WatchStream},
};
use async_trait::async_trait;
use futures::{
    channel::mpsc::{self, UnboundedSender},
    StreamExt,
};
use parking_lot::Mutex;
use std::{borrow::Cow, collections::VecDeque, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestObj {
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: String,
}

impl TestObj {
    pub fn new(name: &str, resource_version: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            resource_version: resource_version.to_string(),
        }
    }

    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

impl Lookup for TestObj {
    fn to_object_ref(&self) -> ObjectRef {
        ObjectRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    fn resource_version(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(&self.resource_version))
    }
}

pub fn list_of(resource_version: &str, items: Vec<TestObj>) -> Result<ObjectList<TestObj>> {
    Ok(ObjectList {
        resource_version: Some(resource_version.to_string()),
        items,
    })
}

pub fn gone() -> ErrorResponse {
    ErrorResponse {
        status: "Failure".into(),
        message: "too old resource version".into(),
        reason: "Expired".into(),
        code: 410,
    }
}

pub type WatchSender = UnboundedSender<Result<WatchEvent<TestObj>>>;

#[derive(Default)]
struct Script {
    lists: VecDeque<Result<ObjectList<TestObj>>>,
    watches: VecDeque<Result<WatchStream<TestObj>>>,
    list_calls: usize,
    watched_versions: Vec<String>,
}

/// A [`ListerWatcher`] that replays scripted responses in order
///
/// Once a script runs dry the corresponding call hangs forever, simulating a server
/// that has nothing more to say.
#[derive(Clone, Default)]
pub struct ScriptedListerWatcher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedListerWatcher {
    pub fn push_list(&self, list: Result<ObjectList<TestObj>>) {
        self.script.lock().lists.push_back(list);
    }

    /// Script a successful watch, returning the sending half of its event stream
    ///
    /// Dropping the sender ends the watch stream.
    pub fn push_watch(&self) -> WatchSender {
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().watches.push_back(Ok(rx.boxed()));
        tx
    }

    pub fn push_watch_err(&self, err: Error) {
        self.script.lock().watches.push_back(Err(err));
    }

    pub fn list_calls(&self) -> usize {
        self.script.lock().list_calls
    }

    pub fn watched_versions(&self) -> Vec<String> {
        self.script.lock().watched_versions.clone()
    }
}

#[async_trait]
impl ListerWatcher<TestObj> for ScriptedListerWatcher {
    async fn list(&self) -> Result<ObjectList<TestObj>> {
        let next = {
            let mut script = self.script.lock();
            script.list_calls += 1;
            script.lists.pop_front()
        };
        match next {
            Some(list) => list,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<TestObj>> {
        let next = {
            let mut script = self.script.lock();
            script.watched_versions.push(resource_version.to_string());
            script.watches.pop_front()
        };
        match next {
            Some(watch) => watch,
            None => futures::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Add(TestObj),
    Update(TestObj, TestObj),
    Delete(TestObj),
}

/// Records every notification it receives, optionally failing on demand
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<Notification>>>,
    pub fail_on_add: bool,
    pub panic_on_update: bool,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl ResourceEventHandler<TestObj> for RecordingHandler {
    fn on_add(&mut self, obj: Arc<TestObj>) -> Result<(), HandlerError> {
        self.seen.lock().push(Notification::Add((*obj).clone()));
        if self.fail_on_add {
            return Err("refusing to add".into());
        }
        Ok(())
    }

    fn on_update(&mut self, old: Arc<TestObj>, new: Arc<TestObj>) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .push(Notification::Update((*old).clone(), (*new).clone()));
        if self.panic_on_update {
            panic!("handler blew up on update");
        }
        Ok(())
    }

    fn on_delete(&mut self, obj: Arc<TestObj>) -> Result<(), HandlerError> {
        self.seen.lock().push(Notification::Delete((*obj).clone()));
        Ok(())
    }
}
