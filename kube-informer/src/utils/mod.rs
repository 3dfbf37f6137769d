//! Helpers shared by the informer's activities

mod backoff_resettable;

pub use backoff_resettable::{DefaultBackoff, ResettableBackoff, ResettableBackoffWrapper};
