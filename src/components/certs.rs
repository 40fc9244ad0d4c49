//! Certificate holders. Their contents are owned by the certificate manager; the
//! operator only creates them and keeps their metadata current.
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::collections::BTreeMap;

use super::*;
use crate::kinds::{MANAGED_BY_LABEL, MANAGED_BY_OPERATOR};

fn tls_secret(namespace: &str, name: &str, component: &str) -> Secret {
    Secret {
        metadata: object_meta(name, Some(namespace), component),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

pub fn all_secrets(namespace: &str, operator_namespace: &str) -> Vec<Secret> {
    vec![
        tls_secret(operator_namespace, KUBEVIRT_CA, ""),
        tls_secret(operator_namespace, KUBEVIRT_EXPORT_CA, ""),
        tls_secret(namespace, "kubevirt-virt-api-certs", VIRT_API),
        tls_secret(namespace, "kubevirt-virt-handler-certs", VIRT_HANDLER),
        tls_secret(namespace, "kubevirt-virt-handler-server-certs", VIRT_HANDLER),
        tls_secret(namespace, "kubevirt-exportproxy-certs", VIRT_EXPORTPROXY),
        tls_secret(operator_namespace, "kubevirt-operator-certs", VIRT_OPERATOR),
    ]
}

fn ca_config_map(namespace: &str, name: &str) -> ConfigMap {
    let mut metadata = object_meta(name, Some(namespace), "");
    if let Some(labels) = metadata.labels.as_mut() {
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_OPERATOR.to_string());
    }
    ConfigMap {
        metadata,
        data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), String::new())])),
        ..Default::default()
    }
}

pub fn all_config_maps(operator_namespace: &str) -> Vec<ConfigMap> {
    vec![
        ca_config_map(operator_namespace, KUBEVIRT_CA),
        ca_config_map(operator_namespace, KUBEVIRT_EXPORT_CA),
    ]
}

/// Holder for CA bundles supplied by the cluster admin; created once and never updated
pub fn external_ca_config_map(operator_namespace: &str) -> ConfigMap {
    ca_config_map(operator_namespace, KUBEVIRT_EXTERNAL_CA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_holders_live_in_the_operator_namespace() {
        let secrets = all_secrets("kubevirt", "kubevirt-op");
        let ca = secrets
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(KUBEVIRT_CA))
            .unwrap();
        assert_eq!(ca.metadata.namespace.as_deref(), Some("kubevirt-op"));
        for cm in all_config_maps("kubevirt-op") {
            assert!(cm.data.unwrap().contains_key(CA_BUNDLE_KEY));
        }
    }
}
