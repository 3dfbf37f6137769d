//! A [`ListerWatcher`] backed by the Kubernetes API
use crate::{
    reflector::{Lookup, ObjectRef},
    watcher::{Error, ErrorResponse, ListerWatcher, ObjectList, Result, WatchEvent, WatchStream},
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{ListParams, WatchParams},
    core::{ErrorResponse as ApiErrorResponse, WatchEvent as ApiWatchEvent},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, fmt::Debug};

/// Server-side watch timeout, kept below the apiserver's 295s cap
const DEFAULT_TIMEOUT_SECS: u32 = 290;

impl<K: Resource> Lookup for K {
    fn to_object_ref(&self) -> ObjectRef {
        ObjectRef {
            name: self.name_any(),
            namespace: self.namespace(),
        }
    }

    fn resource_version(&self) -> Option<Cow<'_, str>> {
        self.meta().resource_version.as_deref().map(Cow::Borrowed)
    }
}

/// Lists and watches the objects visible through an [`Api`]
///
/// The scope of the [`Api`] decides the scope of the informer: `Api::namespaced` watches a
/// single namespace, `Api::all` the whole cluster. Selectors narrow it down further.
///
/// ```no_run
/// use k8s_openapi::api::core::v1::Pod;
/// use kube::{Api, Client};
/// use kube_informer::client::ApiListerWatcher;
/// # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::try_default().await?;
/// let pods = ApiListerWatcher::new(Api::<Pod>::namespaced(client, "default")).labels("app=web");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiListerWatcher<K> {
    api: Api<K>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    timeout: u32,
}

impl<K> Debug for ApiListerWatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiListerWatcher")
            .field("label_selector", &self.label_selector)
            .field("field_selector", &self.field_selector)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<K> ApiListerWatcher<K> {
    /// List and watch everything `api` can see
    #[must_use]
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            label_selector: None,
            field_selector: None,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Only consider objects matching a label selector
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Only consider objects matching a field selector
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Ask the server to end each watch after `timeout_secs`
    ///
    /// The informer transparently resumes the watch afterwards. Must be below 295.
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = timeout_secs;
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(labels) = &self.label_selector {
            lp = lp.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            lp = lp.fields(fields);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.timeout);
        if let Some(labels) = &self.label_selector {
            wp = wp.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            wp = wp.fields(fields);
        }
        wp
    }
}

#[async_trait]
impl<K> ListerWatcher<K> for ApiListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ObjectList<K>> {
        let list = self.api.list(&self.list_params()).await.map_err(from_kube)?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        let stream = self
            .api
            .watch(&self.watch_params(), resource_version)
            .await
            .map_err(from_kube)?;
        Ok(stream
            .map_err(from_kube)
            .map_ok(|event| match event {
                ApiWatchEvent::Added(obj) => WatchEvent::Added(obj),
                ApiWatchEvent::Modified(obj) => WatchEvent::Modified(obj),
                ApiWatchEvent::Deleted(obj) => WatchEvent::Deleted(obj),
                ApiWatchEvent::Bookmark(bookmark) => WatchEvent::Bookmark(bookmark.metadata.resource_version),
                ApiWatchEvent::Error(response) => WatchEvent::Error(convert_response(&response)),
            })
            .boxed())
    }
}

fn convert_response(response: &ApiErrorResponse) -> ErrorResponse {
    ErrorResponse {
        status: response.status.clone(),
        message: response.message.clone(),
        reason: response.reason.clone(),
        code: response.code,
    }
}

/// Classify a client error, singling out expired resume tokens
fn from_kube(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) => {
            let response = convert_response(&response);
            if response.is_expired() {
                Error::Expired(response)
            } else {
                Error::Api(response)
            }
        }
        kube::Error::SerdeError(error) => Error::Decode(Box::new(error)),
        other => Error::Connection(Box::new(other)),
    }
}
