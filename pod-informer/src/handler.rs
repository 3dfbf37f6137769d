use kube_informer::{HandlerError, Lookup, ResourceEventHandler};
use std::sync::Arc;
use tracing::info;

/// Logs one line per notification
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

impl<K: Lookup> ResourceEventHandler<K> for LogHandler {
    fn on_add(&mut self, obj: Arc<K>) -> Result<(), HandlerError> {
        info!(
            key = %obj.to_object_ref(),
            resource_version = obj.resource_version().as_deref(),
            "OnAdd"
        );
        Ok(())
    }

    fn on_update(&mut self, old: Arc<K>, new: Arc<K>) -> Result<(), HandlerError> {
        let resync = old.resource_version() == new.resource_version();
        info!(
            key = %new.to_object_ref(),
            old_resource_version = old.resource_version().as_deref(),
            resource_version = new.resource_version().as_deref(),
            resync,
            "OnUpdate"
        );
        Ok(())
    }

    fn on_delete(&mut self, obj: Arc<K>) -> Result<(), HandlerError> {
        info!(
            key = %obj.to_object_ref(),
            resource_version = obj.resource_version().as_deref(),
            "OnDelete"
        );
        Ok(())
    }
}
