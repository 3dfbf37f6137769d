//! Watch-and-cache informers for Kubernetes resources
//!
//! An [`Informer`] lists a collection of objects, then watches it for changes,
//! keeping a local [`Store`] up to date and notifying registered
//! [`ResourceEventHandler`]s of every addition, update and deletion.
//!
//! The engine is generic over the object type and the transport. Anything implementing
//! [`reflector::Lookup`] can be cached, and anything implementing [`watcher::ListerWatcher`]
//! can feed it. With the `client` feature, [`client::ApiListerWatcher`] watches any
//! `kube::Resource` through a `kube::Api`.
//!
//! Newcomers should generally get started with [`Informer::new`], register handlers with
//! [`Informer::add_handler`], and wait for [`wait::wait_for_cache_sync`] before trusting the store.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;
pub mod controller;
pub mod distributor;
pub mod queue;
pub mod reflector;
pub mod utils;
pub mod wait;
pub mod watcher;

#[cfg(test)]
mod test_utils;

pub use controller::{Informer, InformerConfig, InformerHandle, Lifecycle, SyncBarrier};
pub use distributor::{HandlerError, ResourceEventHandler};
pub use reflector::{Lookup, ObjectRef, Store};
pub use wait::wait_for_cache_sync;
