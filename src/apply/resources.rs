use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::api::{DeleteParams, Patch};
use serde_json::{Value, json};
use tracing::*;

use super::Reconciler;
use super::delete::delete_object;
use super::meta::{
    content_ops, expected_generation, inject_operator_metadata, is_derivative, labels_and_annotations_ops,
    metadata_needs_update, pointer, set_generation, test_generation_op,
};
use crate::components::VIRT_EXPORTPROXY;
use crate::components::certs::external_ca_config_map;
use crate::kinds::{Kind, ManagedObject};
use crate::{Error, Result};

/// Label asking cluster monitoring to scrape the install namespace
pub static CLUSTER_MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

/// How far the operator reconciles an existing object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdatePolicy {
    /// Labels and annotations only, the content belongs to someone else
    Metadata,
    /// Top level fields are rewritten whenever they differ from the live object
    Content,
    /// Content is rewritten when the live generation differs from the recorded one
    Generation,
}

impl UpdatePolicy {
    pub(crate) fn for_kind(kind: Kind) -> Self {
        match kind {
            Kind::ServiceAccount | Kind::Secret | Kind::ConfigMap => UpdatePolicy::Metadata,
            k if k.tracks_generation() => UpdatePolicy::Generation,
            _ => UpdatePolicy::Content,
        }
    }
}

fn json_patch(ops: Vec<json_patch::PatchOperation>) -> Patch<Value> {
    Patch::Json(json_patch::Patch(ops))
}

impl Reconciler<'_> {
    /// Creates `desired` when it is missing from the cache and patches it when it drifted.
    ///
    /// With `force` an existing object is patched even when it looks current.
    pub(crate) async fn apply_object(&mut self, desired: ManagedObject, force: bool) -> Result<ManagedObject> {
        let key = desired.key();
        let cached = self.stores.get(key.kind, key.namespace.as_deref(), &key.name);
        self.apply_against(desired, cached, force).await
    }

    /// [`Self::apply_object`] against an explicitly supplied live object
    pub(crate) async fn apply_against(
        &mut self,
        mut desired: ManagedObject,
        cached: Option<ManagedObject>,
        force: bool,
    ) -> Result<ManagedObject> {
        let kind = desired.kind();
        let policy = UpdatePolicy::for_kind(kind);
        inject_operator_metadata(
            self.kv,
            desired.meta_mut(),
            &self.target,
            policy == UpdatePolicy::Generation,
        );
        let key = desired.key();

        let Some(cached) = cached else {
            self.expectations.raise_expectations(kind, &self.kv_key, 1, 0);
            let created = match self.client.create(&desired).await {
                Ok(created) => created,
                Err(e) => {
                    self.expectations.lower_expectations(kind, &self.kv_key, 1, 0);
                    return Err(e);
                }
            };
            if kind.tracks_generation() {
                set_generation(self.kv, &created);
            }
            debug!("{key} created");
            return Ok(created);
        };

        let modified = metadata_needs_update(cached.meta(), desired.meta());
        let mut ops = vec![];
        let content = match policy {
            UpdatePolicy::Metadata => {
                if !modified && !force {
                    return Ok(cached);
                }
                vec![]
            }
            UpdatePolicy::Content => {
                let content = content_ops(&desired.to_value()?, &cached.to_value()?, false);
                if !modified && !force && content.is_empty() {
                    return Ok(cached);
                }
                content
            }
            UpdatePolicy::Generation => {
                if !modified && !force && cached.generation() == expected_generation(self.kv, &desired) {
                    trace!("{key} is up to date");
                    return Ok(cached);
                }
                ops.push(test_generation_op(cached.generation()));
                content_ops(&desired.to_value()?, &cached.to_value()?, true)
            }
        };
        ops.extend(labels_and_annotations_ops(desired.meta()));
        ops.extend(content);

        let patched = self.client.patch(&key, &json_patch(ops)).await?;
        if kind.tracks_generation() {
            set_generation(self.kv, &patched);
        }
        debug!("{key} updated");
        Ok(patched)
    }

    pub(crate) async fn apply_all(&mut self, objects: Vec<ManagedObject>) -> Result<()> {
        for object in objects {
            self.apply_object(object, false).await?;
        }
        Ok(())
    }

    /// Deletes the cached counterpart of `object` unless it is already gone or going
    pub(crate) async fn delete_if_exists(&self, object: &ManagedObject, params: &DeleteParams) -> Result<()> {
        let key = object.key();
        match self.stores.get(key.kind, key.namespace.as_deref(), &key.name) {
            Some(cached) if !cached.is_terminating() => {
                delete_object(&self.kv_key, self.client, self.expectations, &cached, params).await
            }
            _ => Ok(()),
        }
    }

    /// Service accounts, cluster roles, cluster role bindings, roles, role bindings
    pub(crate) async fn create_or_update_rbac(&mut self) -> Result<()> {
        let s = &self.strategy;
        let objects: Vec<ManagedObject> = s
            .service_accounts()
            .iter()
            .cloned()
            .map(ManagedObject::ServiceAccount)
            .chain(s.cluster_roles().iter().cloned().map(ManagedObject::ClusterRole))
            .chain(s.cluster_role_bindings().iter().cloned().map(ManagedObject::ClusterRoleBinding))
            .chain(s.roles().iter().cloned().map(ManagedObject::Role))
            .chain(s.role_bindings().iter().cloned().map(ManagedObject::RoleBinding))
            .collect();
        self.apply_all(objects).await
    }

    /// Returns true while a service is being replaced and the pass has to wait for it
    pub(crate) async fn create_or_update_services(&mut self) -> Result<bool> {
        let mut pending = false;
        for service in self.strategy.services().to_vec() {
            if service.metadata.name.as_deref() == Some(VIRT_EXPORTPROXY) && !self.kv.export_proxy_enabled() {
                self.delete_if_exists(&ManagedObject::Service(service), &grace_zero())
                    .await?;
                continue;
            }
            if self.create_or_update_service(service).await? {
                pending = true;
            }
        }
        Ok(pending)
    }

    async fn create_or_update_service(&mut self, service: Service) -> Result<bool> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let namespace = service.metadata.namespace.clone();
        let cached = match self.stores.get(Kind::Service, namespace.as_deref(), &name) {
            None => {
                self.apply_object(ManagedObject::Service(service), false).await?;
                return Ok(false);
            }
            Some(ManagedObject::Service(cached)) => cached,
            Some(other) => return Err(Error::UnknownKind(other.kind().to_string())),
        };
        if cached.metadata.deletion_timestamp.is_some() {
            debug!("waiting for service {name} to be removed");
            return Ok(true);
        }

        let mut desired = service;
        inject_operator_metadata(self.kv, &mut desired.metadata, &self.target, false);
        if has_immutable_field_changed(&desired, &cached) {
            info!("service {name} changed an immutable field, replacing it");
            delete_object(
                &self.kv_key,
                self.client,
                self.expectations,
                &ManagedObject::Service(cached),
                &grace_zero(),
            )
            .await?;
            return Ok(true);
        }

        let mut ops = vec![];
        if metadata_needs_update(&cached.metadata, &desired.metadata) {
            ops.extend(labels_and_annotations_ops(&desired.metadata));
        }
        let spec = merged_service_spec(&desired, &cached);
        if !is_derivative(&serde_json::to_value(&spec)?, &serde_json::to_value(&cached.spec)?) {
            ops.push(json_patch::PatchOperation::Replace(json_patch::ReplaceOperation {
                path: pointer(&["spec"]),
                value: serde_json::to_value(&spec)?,
            }));
        }
        if ops.is_empty() {
            return Ok(false);
        }
        let key = ManagedObject::Service(cached).key();
        self.client.patch(&key, &json_patch(ops)).await?;
        debug!("{key} updated");
        Ok(false)
    }

    /// CA holders, the external CA bundle, certificate secrets, then everything that
    /// embeds the CA bundle
    pub(crate) async fn create_or_update_components_with_certificates(&mut self) -> Result<()> {
        let config_maps = self.strategy.config_maps().iter().cloned().map(ManagedObject::ConfigMap).collect();
        self.apply_all(config_maps).await?;
        self.create_external_ca_config_map().await?;
        let secrets = self
            .strategy
            .certificate_secrets()
            .iter()
            .cloned()
            .map(ManagedObject::Secret)
            .collect();
        self.apply_all(secrets).await?;

        let ca_bundle = self.ca_bundle();
        self.create_or_update_validating_webhooks(ca_bundle.as_deref()).await?;
        self.create_or_update_mutating_webhooks(ca_bundle.as_deref()).await?;
        self.create_or_update_api_services(ca_bundle.as_deref()).await
    }

    /// The external CA config map is filled by the admin and only ever created
    async fn create_external_ca_config_map(&mut self) -> Result<()> {
        let namespace = self.kv.metadata.namespace.clone().unwrap_or_default();
        let config_map = external_ca_config_map(&namespace);
        let name = config_map.metadata.name.clone().unwrap_or_default();
        if self.stores.get(Kind::ConfigMap, Some(&namespace), &name).is_some() {
            return Ok(());
        }
        self.apply_object(ManagedObject::ConfigMap(config_map), false).await?;
        Ok(())
    }

    /// Adds the cluster monitoring label to the install namespace when it is missing
    pub(crate) async fn sync_kubevirt_namespace_labels(&self) -> Result<()> {
        let namespace = self.kv.metadata.namespace.clone().unwrap_or_default();
        let Some(cached) = self.stores.get(Kind::Namespace, None, &namespace) else {
            return Err(Error::OtherError(format!("namespace {namespace} not found in cache")));
        };
        let labels = cached.labels();
        if labels.get(CLUSTER_MONITORING_LABEL).map(String::as_str) == Some("true") {
            return Ok(());
        }
        info!("labelling namespace {namespace} for cluster monitoring");
        let patch = Patch::Merge(json!({ "metadata": { "labels": { CLUSTER_MONITORING_LABEL: "true" } } }));
        self.client.patch(&cached.key(), &patch).await?;
        Ok(())
    }
}

pub(crate) fn grace_zero() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        ..DeleteParams::default()
    }
}

fn is_cluster_ip(spec: Option<&ServiceSpec>) -> bool {
    matches!(spec.and_then(|s| s.type_.as_deref()), None | Some("") | Some("ClusterIP"))
}

fn service_type(spec: Option<&ServiceSpec>) -> &str {
    if is_cluster_ip(spec) {
        return "ClusterIP";
    }
    spec.and_then(|s| s.type_.as_deref()).unwrap_or_default()
}

/// Type and a pinned cluster IP can only change by recreating the service
pub(crate) fn has_immutable_field_changed(desired: &Service, cached: &Service) -> bool {
    let (want, have) = (desired.spec.as_ref(), cached.spec.as_ref());
    if service_type(want) != service_type(have) {
        return true;
    }
    let want_ip = want.and_then(|s| s.cluster_ip.as_deref()).unwrap_or_default();
    let have_ip = have.and_then(|s| s.cluster_ip.as_deref()).unwrap_or_default();
    !want_ip.is_empty() && want_ip != have_ip
}

/// Desired spec carrying over the fields the API server assigns
fn merged_service_spec(desired: &Service, cached: &Service) -> ServiceSpec {
    let mut spec = desired.spec.clone().unwrap_or_default();
    if let Some(live) = cached.spec.as_ref() {
        spec.cluster_ip = live.cluster_ip.clone();
        spec.cluster_ips = live.cluster_ips.clone();
        if spec.type_.is_none() {
            spec.type_ = live.type_.clone();
        }
        if spec.session_affinity.is_none() {
            spec.session_affinity = live.session_affinity.clone();
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(type_: Option<&str>, ip: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: type_.map(str::to_string),
                cluster_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn type_and_pinned_ip_are_immutable() {
        let live = service(Some("ClusterIP"), Some("10.0.0.1"));
        assert!(!has_immutable_field_changed(&service(None, None), &live));
        assert!(has_immutable_field_changed(&service(Some("NodePort"), None), &live));
        assert!(has_immutable_field_changed(&service(None, Some("10.0.0.2")), &live));
        assert!(!has_immutable_field_changed(&service(None, Some("10.0.0.1")), &live));
    }

    #[test]
    fn assigned_fields_are_carried_over() {
        let live = service(Some("ClusterIP"), Some("10.0.0.1"));
        let spec = merged_service_spec(&service(None, None), &live);
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn policies_follow_the_kind() {
        assert_eq!(UpdatePolicy::for_kind(Kind::Secret), UpdatePolicy::Metadata);
        assert_eq!(UpdatePolicy::for_kind(Kind::ClusterRole), UpdatePolicy::Content);
        assert_eq!(UpdatePolicy::for_kind(Kind::Deployment), UpdatePolicy::Generation);
    }
}
