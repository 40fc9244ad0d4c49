use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// Finalizer owned by the operator on the KubeVirt CR
pub static KUBEVIRT_FINALIZER: &str = "foregroundDeleteKubeVirt";

/// Feature gate that turns on the export proxy deployment
pub static VM_EXPORT_GATE: &str = "VMExport";

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "KubeVirt",
    derive = "Default",
    derive = "PartialEq",
    namespaced,
    shortname = "kv",
    doc = "KubeVirt represents the desired installation of the KubeVirt stack",
    printcolumn = r#"{"name":"Phase","jsonPath":".status.phase","type":"string"}"#,
    printcolumn = r#"{"name":"Age","jsonPath":".metadata.creationTimestamp","type":"date"}"#,
    status = "KubeVirtStatus"
)]
pub struct KubeVirtSpec {
    /// Tag of the component images, defaults to the operator's own tag
    pub image_tag: Option<String>,
    /// Registry of the component images, defaults to the operator's own registry
    pub image_registry: Option<String>,
    pub image_pull_policy: Option<String>,
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    /// Namespace Prometheus is deployed in
    pub monitor_namespace: Option<String>,
    /// Namespace the service monitor is placed in, defaults to the monitor namespace
    pub service_monitor_namespace: Option<String>,
    /// Prometheus service account that needs read access to the metrics endpoints
    pub monitor_account: Option<String>,
    pub uninstall_strategy: Option<String>,
    pub product_version: Option<String>,
    pub product_name: Option<String>,
    pub product_component: Option<String>,
    pub configuration: Option<KubeVirtConfiguration>,
    /// Placement of the infrastructure components
    pub infra: Option<ComponentConfig>,
    /// Placement of the workloads
    pub workloads: Option<ComponentConfig>,
    pub customize_components: Option<CustomizeComponents>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtConfiguration {
    pub developer_configuration: Option<DeveloperConfiguration>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperConfiguration {
    pub feature_gates: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub node_placement: Option<NodePlacement>,
    pub replicas: Option<u8>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    pub node_selector: Option<BTreeMap<String, String>>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeComponents {
    pub patches: Option<Vec<CustomizeComponentsPatch>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeComponentsPatch {
    pub resource_name: String,
    pub resource_type: String,
    pub patch: String,
    #[serde(rename = "type")]
    pub type_: PatchType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    #[default]
    Json,
    Merge,
    Strategic,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum KubeVirtPhase {
    Deploying,
    Deployed,
    Deleting,
    Deleted,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Whether the deployment or deletion was successful, only present when false
    Synchronized,
    /// Whether all resources were created and are up to date
    Created,
    Available,
    Progressing,
    Degraded,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: String,
    pub last_probe_time: Option<Time>,
    pub last_transition_time: Option<Time>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Last generation the operator wrote for one managed object
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub group: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: String,
    pub last_generation: i64,
    pub hash: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtStatus {
    pub phase: Option<KubeVirtPhase>,
    pub conditions: Option<Vec<KubeVirtCondition>>,
    pub operator_version: Option<String>,
    pub target_kube_virt_registry: Option<String>,
    pub target_kube_virt_version: Option<String>,
    pub target_deployment_config: Option<String>,
    #[serde(rename = "targetDeploymentID")]
    pub target_deployment_id: Option<String>,
    pub observed_kube_virt_registry: Option<String>,
    pub observed_kube_virt_version: Option<String>,
    pub observed_deployment_config: Option<String>,
    #[serde(rename = "observedDeploymentID")]
    pub observed_deployment_id: Option<String>,
    pub observed_generation: Option<i64>,
    pub generations: Option<Vec<GenerationStatus>>,
}

impl KubeVirt {
    pub fn status_ref(&self) -> KubeVirtStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut KubeVirtStatus {
        self.status.get_or_insert_with(KubeVirtStatus::default)
    }

    pub fn feature_gates(&self) -> Vec<String> {
        self.spec
            .configuration
            .as_ref()
            .and_then(|c| c.developer_configuration.as_ref())
            .and_then(|d| d.feature_gates.clone())
            .unwrap_or_default()
    }

    pub fn is_feature_gate_enabled(&self, gate: &str) -> bool {
        self.feature_gates().iter().any(|g| g == gate)
    }

    pub fn export_proxy_enabled(&self) -> bool {
        self.is_feature_gate_enabled(VM_EXPORT_GATE)
    }

    /// True while a previously observed deployment is being replaced by a new target
    pub fn is_updating(&self) -> bool {
        let status = self.status_ref();
        let observed = status.observed_deployment_id.unwrap_or_default();
        let target = status.target_deployment_id.unwrap_or_default();
        !observed.is_empty() && observed != target
    }

    pub fn patches(&self) -> Vec<CustomizeComponentsPatch> {
        self.spec
            .customize_components
            .as_ref()
            .and_then(|c| c.patches.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_updating_requires_observed_id() {
        let mut kv = KubeVirt::new("kv", KubeVirtSpec::default());
        assert!(!kv.is_updating());
        kv.status_mut().target_deployment_id = Some("b".into());
        assert!(!kv.is_updating());
        kv.status_mut().observed_deployment_id = Some("a".into());
        assert!(kv.is_updating());
        kv.status_mut().observed_deployment_id = Some("b".into());
        assert!(!kv.is_updating());
    }

    #[test]
    fn status_uses_upper_case_id_fields() {
        let status = KubeVirtStatus {
            target_deployment_id: Some("abc".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["targetDeploymentID"], "abc");
    }
}
