use tracing::*;

use super::{KubeVirtController, OBJECT_EVENT_DEBOUNCE};
use crate::crd::KubeVirt;
use crate::kinds::{Kind, ManagedObject};
use crate::{Error, Result};

/// Receives the informer events of every managed kind
pub trait ObjectEventHandler: Send + Sync {
    fn on_add(&self, object: &ManagedObject);
    fn on_update(&self, old: &ManagedObject, new: &ManagedObject);
    fn on_delete(&self, object: &ManagedObject);
}

impl KubeVirtController {
    /// Key of the one KubeVirt CR, `None` when there is none
    pub fn kubevirt_key(&self) -> Result<Option<String>> {
        let kubevirts = self.kubevirts.state();
        match kubevirts.as_slice() {
            [] => Ok(None),
            [kv] => Ok(Some(Self::kv_key(kv))),
            more => {
                error!("more than one KubeVirt custom resource detected: {}", more.len());
                Err(Error::OtherError(format!(
                    "more than one KubeVirt custom resource detected: {}",
                    more.len()
                )))
            }
        }
    }

    pub fn enqueue_kubevirt(&self, kv: &KubeVirt) {
        self.queue.add(&Self::kv_key(kv));
    }

    fn enqueue_after_event(&self) -> Option<String> {
        let key = self.kubevirt_key().ok().flatten()?;
        self.queue.add_after(&key, OBJECT_EVENT_DEBOUNCE);
        Some(key)
    }
}

/// Only labelled SCCs belong to the operator, the rest are the platform's
fn is_relevant(object: &ManagedObject) -> bool {
    object.kind() != Kind::Scc || object.is_managed_by_operator()
}

impl ObjectEventHandler for KubeVirtController {
    fn on_add(&self, object: &ManagedObject) {
        if !is_relevant(object) {
            return;
        }
        // an object that shows up already terminating is not a creation
        if object.is_terminating() {
            return self.on_delete(object);
        }
        if let Some(key) = self.enqueue_after_event() {
            if object.kind().tracks_expectations() {
                self.expectations.creation_observed(object.kind(), &key);
            }
            trace!("observed creation of {}", object.key());
        }
    }

    fn on_update(&self, old: &ManagedObject, new: &ManagedObject) {
        if !is_relevant(new) || old.resource_version() == new.resource_version() {
            return;
        }
        if new.is_terminating() {
            return self.on_delete(new);
        }
        self.enqueue_after_event();
    }

    fn on_delete(&self, object: &ManagedObject) {
        if !is_relevant(object) {
            return;
        }
        if let Some(key) = self.enqueue_after_event() {
            if object.kind().tracks_expectations() {
                self.expectations
                    .deletion_observed(object.kind(), &key, &object.key().cache_key());
            }
            trace!("observed deletion of {}", object.key());
        }
    }
}
