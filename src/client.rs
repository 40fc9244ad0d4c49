//! Write side of the operator. Reads go through the informer caches in [`crate::stores`].
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};

use crate::crd::KubeVirt;
use crate::events_helper::{emit_info, emit_warning};
use crate::kinds::{ManagedObject, ObjectKey};
use crate::Result;

/// Cluster operations issued by the reconciler and the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject>;

    async fn patch(&self, key: &ObjectKey, patch: &Patch<Value>) -> Result<ManagedObject>;

    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<()>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>>;

    /// Unconditional update of a config map, used by dump mode
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    async fn update_kubevirt(&self, kv: &KubeVirt) -> Result<KubeVirt>;

    async fn update_kubevirt_status(&self, kv: &KubeVirt) -> Result<KubeVirt>;

    async fn patch_kubevirt(&self, namespace: &str, name: &str, patch: &Patch<Value>) -> Result<KubeVirt>;

    /// Publishes an event on the CR, failures are only logged
    async fn publish_event(&self, kv: &KubeVirt, warning: bool, reason: &str, action: &str, note: String);
}

/// [`ClusterClient`] backed by the API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    recorder: Recorder,
}

impl KubeClient {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    fn kubevirts(&self, namespace: &str) -> Api<KubeVirt> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject> {
        Ok(object.create_in(self.client.clone()).await?)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Patch<Value>) -> Result<ManagedObject> {
        let ns = key.namespace.as_deref();
        Ok(key.kind.patch_in(self.client.clone(), ns, &key.name, patch).await?)
    }

    async fn delete(&self, key: &ObjectKey, params: &DeleteParams) -> Result<()> {
        let ns = key.namespace.as_deref();
        Ok(key.kind.delete_in(self.client.clone(), ns, &key.name, params).await?)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        let ns = key.namespace.as_deref();
        Ok(key.kind.get_in(self.client.clone(), ns, &key.name).await?)
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or_default();
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), config_map).await?)
    }

    async fn update_kubevirt(&self, kv: &KubeVirt) -> Result<KubeVirt> {
        let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
        let name = kv.metadata.name.as_deref().unwrap_or_default();
        Ok(self.kubevirts(namespace).replace(name, &PostParams::default(), kv).await?)
    }

    async fn update_kubevirt_status(&self, kv: &KubeVirt) -> Result<KubeVirt> {
        let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
        let name = kv.metadata.name.as_deref().unwrap_or_default();
        let patch = Patch::Merge(json!({ "status": kv.status }));
        Ok(self
            .kubevirts(namespace)
            .patch_status(name, &PatchParams::default(), &patch)
            .await?)
    }

    async fn patch_kubevirt(&self, namespace: &str, name: &str, patch: &Patch<Value>) -> Result<KubeVirt> {
        Ok(self
            .kubevirts(namespace)
            .patch(name, &PatchParams::default(), patch)
            .await?)
    }

    async fn publish_event(&self, kv: &KubeVirt, warning: bool, reason: &str, action: &str, note: String) {
        if warning {
            emit_warning(&self.recorder, kv, reason, action, note).await;
        } else {
            emit_info(&self.recorder, kv, reason, action, note).await;
        }
    }
}
