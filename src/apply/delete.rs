//! Teardown of an installation and pruning of objects a new version no longer ships.
use json_patch::{PatchOperation, RemoveOperation, ReplaceOperation, TestOperation};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, Patch};
use serde_json::json;
use tracing::*;

use super::Reconciler;
use super::resources::grace_zero;
use super::meta::pointer;
use crate::client::ClusterClient;
use crate::components::KUBEVIRT_EXTERNAL_CA;
use crate::components::admission::is_temporary_webhook;
use crate::expectations::Expectations;
use crate::kinds::{COMPONENT_FINALIZER, Kind, ManagedObject, ObjectKey};
use crate::stores::Stores;
use crate::Result;

/// Kinds removed by [`delete_all`] once the CRDs are gone, in order
pub const DELETE_ORDER: &[Kind] = &[
    Kind::DaemonSet,
    Kind::PodDisruptionBudget,
    Kind::Deployment,
    Kind::ValidatingWebhook,
    Kind::MutatingWebhook,
    Kind::ApiService,
    Kind::Service,
    Kind::ServiceMonitor,
    Kind::PrometheusRule,
    Kind::ClusterRoleBinding,
    Kind::ClusterRole,
    Kind::RoleBinding,
    Kind::Role,
    Kind::ServiceAccount,
    Kind::Secret,
    Kind::ConfigMap,
    Kind::Scc,
    Kind::Route,
    Kind::ValidatingAdmissionPolicyBinding,
    Kind::ValidatingAdmissionPolicy,
];

/// Kinds pruned after a roll over when the target strategy lacks them, in order.
/// Webhooks go first since stale ones can block the other deletes.
const PRUNE_ORDER: &[Kind] = &[
    Kind::ValidatingWebhook,
    Kind::MutatingWebhook,
    Kind::ApiService,
    Kind::Secret,
    Kind::ConfigMap,
    Kind::Crd,
    Kind::DaemonSet,
    Kind::Deployment,
    Kind::Service,
    Kind::ClusterRoleBinding,
    Kind::ClusterRole,
    Kind::RoleBinding,
    Kind::Role,
    Kind::ServiceAccount,
    Kind::Scc,
    Kind::PrometheusRule,
    Kind::ServiceMonitor,
];

/// Issues a delete on behalf of `kv_key`, recording the expected deletion first
pub async fn delete_object(
    kv_key: &str,
    client: &dyn ClusterClient,
    expectations: &Expectations,
    object: &ManagedObject,
    params: &DeleteParams,
) -> Result<()> {
    let key = object.key();
    let cache_key = key.cache_key();
    expectations.add_expected_deletion(key.kind, kv_key, &cache_key);
    match client.delete(&key, params).await {
        Ok(()) => {
            debug!("{key} deleted");
            Ok(())
        }
        Err(e) => {
            expectations.deletion_observed(key.kind, kv_key, &cache_key);
            if e.is_not_found() {
                return Ok(());
            }
            error!("failed to delete {key}: {e}");
            Err(e)
        }
    }
}

/// Objects of `kind` the operator may delete: live, and for SCCs labelled as ours
fn deletable(stores: &Stores, kind: Kind) -> Vec<ManagedObject> {
    stores
        .list(kind)
        .into_iter()
        .filter(|o| !o.is_terminating())
        .filter(|o| kind != Kind::Scc || o.is_managed_by_operator())
        .collect()
}

pub async fn delete_dummy_webhook_validators(
    kv_key: &str,
    stores: &Stores,
    client: &dyn ClusterClient,
    expectations: &Expectations,
) -> Result<()> {
    for webhook in deletable(stores, Kind::ValidatingWebhook) {
        if !is_temporary_webhook(webhook.meta()) {
            continue;
        }
        delete_object(kv_key, client, expectations, &webhook, &grace_zero()).await?;
        info!("temporary validation webhook {} deleted", webhook.name());
    }
    Ok(())
}

fn crd_instance_deletion_completed(crd: &CustomResourceDefinition) -> bool {
    if crd.metadata.deletion_timestamp.is_none() {
        return false;
    }
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "Terminating"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("InstanceDeletionCompleted")
            })
        })
}

fn has_component_finalizer(crd: &CustomResourceDefinition) -> bool {
    crd.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == COMPONENT_FINALIZER))
}

/// Puts the component finalizer on every CRD, deletes them, and drops the finalizer once
/// every CRD reports all of its instances removed
async fn crd_handle_deletion(
    kv_key: &str,
    stores: &Stores,
    client: &dyn ClusterClient,
    expectations: &Expectations,
) -> Result<()> {
    let crds: Vec<CustomResourceDefinition> = stores.crds.state().iter().map(|c| (**c).clone()).collect();
    let key_of = |crd: &CustomResourceDefinition| {
        ObjectKey::new(Kind::Crd, None, crd.metadata.name.as_deref().unwrap_or_default())
    };

    for crd in crds.iter().filter(|c| c.metadata.deletion_timestamp.is_none() && !has_component_finalizer(c)) {
        let mut finalizers = crd.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(COMPONENT_FINALIZER.to_string());
        let patch = Patch::Json(json_patch::Patch(vec![PatchOperation::Add(json_patch::AddOperation {
            path: pointer(&["metadata", "finalizers"]),
            value: json!(finalizers),
        })]));
        client.patch(&key_of(crd), &patch).await?;
    }

    for crd in crds.iter().filter(|c| c.metadata.deletion_timestamp.is_none()) {
        delete_object(
            kv_key,
            client,
            expectations,
            &ManagedObject::Crd(crd.clone()),
            &DeleteParams::default(),
        )
        .await?;
    }

    if !crds.iter().all(crd_instance_deletion_completed) {
        return Ok(());
    }
    for crd in crds.iter().filter(|c| has_component_finalizer(c)) {
        let current = crd.metadata.finalizers.clone().unwrap_or_default();
        let ops = if current.len() > 1 {
            let remaining: Vec<&String> = current.iter().filter(|f| *f != COMPONENT_FINALIZER).collect();
            vec![
                PatchOperation::Test(TestOperation {
                    path: pointer(&["metadata", "finalizers"]),
                    value: json!(current),
                }),
                PatchOperation::Replace(ReplaceOperation {
                    path: pointer(&["metadata", "finalizers"]),
                    value: json!(remaining),
                }),
            ]
        } else {
            vec![PatchOperation::Remove(RemoveOperation {
                path: pointer(&["metadata", "finalizers"]),
            })]
        };
        client.patch(&key_of(crd), &Patch::Json(json_patch::Patch(ops))).await?;
    }
    Ok(())
}

/// Removes everything the operator installed. CRDs go first and everything else waits
/// until they are gone, so no instance outlives the components that serve it.
pub async fn delete_all(kv_key: &str, stores: &Stores, client: &dyn ClusterClient, expectations: &Expectations) -> Result<()> {
    crd_handle_deletion(kv_key, stores, client, expectations).await?;
    if stores.len(Kind::Crd) > 0 {
        debug!("waiting for {} CRDs to be removed", stores.len(Kind::Crd));
        return Ok(());
    }

    for kind in DELETE_ORDER {
        let params = match kind {
            Kind::PodDisruptionBudget => DeleteParams::default(),
            _ => grace_zero(),
        };
        for object in deletable(stores, *kind) {
            if *kind == Kind::ValidatingWebhook && is_temporary_webhook(object.meta()) {
                continue;
            }
            delete_object(kv_key, client, expectations, &object, &params).await?;
        }
    }

    delete_dummy_webhook_validators(kv_key, stores, client, expectations).await
}

impl Reconciler<'_> {
    fn keep_on_prune(&self, object: &ManagedObject) -> bool {
        match object.kind() {
            Kind::ValidatingWebhook if is_temporary_webhook(object.meta()) => true,
            Kind::ConfigMap if object.name() == KUBEVIRT_EXTERNAL_CA => true,
            kind => self.strategy.contains(kind, object.namespace(), object.name()),
        }
    }

    /// Deletes managed objects the target strategy no longer contains
    pub(crate) async fn delete_objects_not_in_install_strategy(&self) -> Result<()> {
        for kind in PRUNE_ORDER {
            for object in deletable(self.stores, *kind) {
                if self.keep_on_prune(&object) {
                    continue;
                }
                info!("pruning {} which is not part of the install strategy", object.key());
                delete_object(&self.kv_key, self.client, self.expectations, &object, &grace_zero()).await?;
            }
        }
        Ok(())
    }
}
