//! The list/watch transport consumed by the [`Reflector`](crate::reflector::Reflector)
//!
//! A [`ListerWatcher`] knows how to enumerate the current state of a collection
//! and how to stream changes to it from a resume point. The informer never talks
//! to the network directly, which keeps the engine independent of the resource
//! kind and lets tests script the remote side.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use thiserror::Error;

/// Boxed error type carried by transport failures that have no better representation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// HTTP status code returned by the apiserver when a resume token is too old
pub const GONE: u16 = 410;

/// An error response from the remote API
///
/// Mirrors the `Status` object returned by the Kubernetes apiserver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    pub message: String,
    /// The reason for the error
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Whether this response says the requested resume token is no longer available
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.code == GONE || self.reason == "Expired" || self.reason == "Gone"
    }
}

/// Errors surfaced by a [`ListerWatcher`]
///
/// None of these are fatal to the informer: they all lead to a backoff and a retry.
#[derive(Error, Debug)]
pub enum Error {
    /// The remote API rejected the request
    #[error("ApiError: {0}")]
    Api(#[source] ErrorResponse),

    /// The resume token handed to `watch` is too old to resume from
    ///
    /// The reflector discards its token and performs a fresh list.
    #[error("resource version expired: {0}")]
    Expired(#[source] ErrorResponse),

    /// The connection could not be established, or dropped mid-stream
    #[error("connection failed: {0}")]
    Connection(#[source] BoxError),

    /// A payload could not be decoded
    #[error("failed to decode payload: {0}")]
    Decode(#[source] BoxError),

    /// A list response carried no collection resource version to resume from
    #[error("list response did not contain a resource version")]
    MissingResourceVersion,
}

impl Error {
    /// Whether this error means the resume token must be discarded
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self {
            Error::Expired(_) => true,
            Error::Api(resp) => resp.is_expired(),
            _ => false,
        }
    }
}

/// Result alias for transport operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A snapshot of a whole collection, as returned by [`ListerWatcher::list`]
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    /// Collection-level resume token to start watching from
    pub resource_version: Option<String>,
    /// Every object in the collection, in server order
    pub items: Vec<K>,
}

/// A raw event returned from a watch
#[derive(Clone)]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    ///
    /// The object may be a slimmed down version carrying little more than its identity.
    Deleted(K),
    /// Resume point marker carrying only a resource version
    Bookmark(String),
    /// There was some kind of error
    Error(ErrorResponse),
}

impl<K> fmt::Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(rv) => write!(f, "Bookmark event at {rv}"),
            WatchEvent::Error(e) => write!(f, "Error event: {e:?}"),
        }
    }
}

/// Stream of events returned by [`ListerWatcher::watch`]
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// A bidirectional channel to a remote resource collection
///
/// Implemented by [`ApiListerWatcher`](crate::client::ApiListerWatcher) for any `kube::Resource`.
#[async_trait]
pub trait ListerWatcher<K>: Send + Sync {
    /// Enumerate the current state of the collection
    async fn list(&self) -> Result<ObjectList<K>>;

    /// Stream changes to the collection that happened after `resource_version`
    ///
    /// Implementations should return [`Error::Expired`] (or an [`Error::Api`] with code 410)
    /// when the token is too old, and should end the stream after a bounded time so that
    /// the connection is recycled.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>>;
}
