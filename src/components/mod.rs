//! Builders for every object an installation consists of.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::*;

use crate::config::DeploymentConfig;
use crate::helper::is_valid_label;
use crate::kinds::{APP_COMPONENT_LABEL, APP_LABEL, APP_PART_OF_LABEL, APP_VERSION_LABEL};

pub mod admission;
pub mod certs;
pub mod crds;
pub mod monitoring;
pub mod placement;
pub mod rbac;
pub mod workloads;

pub static VIRT_API: &str = "virt-api";
pub static VIRT_CONTROLLER: &str = "virt-controller";
pub static VIRT_HANDLER: &str = "virt-handler";
pub static VIRT_EXPORTPROXY: &str = "virt-exportproxy";
pub static VIRT_OPERATOR: &str = "virt-operator";
pub static VIRT_LAUNCHER: &str = "virt-launcher";
pub static VIRT_EXPORTSERVER: &str = "virt-exportserver";

pub static OPERATOR_SERVICE_ACCOUNT: &str = "kubevirt-operator";
pub static API_SERVICE_ACCOUNT: &str = "kubevirt-apiserver";
pub static CONTROLLER_SERVICE_ACCOUNT: &str = "kubevirt-controller";
pub static HANDLER_SERVICE_ACCOUNT: &str = "kubevirt-handler";
pub static EXPORTPROXY_SERVICE_ACCOUNT: &str = "kubevirt-exportproxy";

pub static KUBEVIRT_CA: &str = "kubevirt-ca";
pub static KUBEVIRT_EXPORT_CA: &str = "kubevirt-export-ca";
pub static KUBEVIRT_EXTERNAL_CA: &str = "kubevirt-external-ca";
/// Key of the CA bundle in the CA config maps
pub static CA_BUNDLE_KEY: &str = "ca-bundle";

pub static PROMETHEUS_LABEL: &str = "prometheus.kubevirt.io";

/// Metadata shared by generated objects: the component label and nothing else, the
/// operator labels are added when the object is applied
pub(crate) fn object_meta(name: &str, namespace: Option<&str>, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(APP_LABEL.to_string(), component.to_string())])),
        ..Default::default()
    }
}

/// Product labels for pod templates. Values that are not valid label values are dropped.
pub fn product_labels(config: &DeploymentConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut add = |key: &str, value: &str, field: &str| {
        if value.is_empty() {
            return;
        }
        if is_valid_label(value) {
            labels.insert(key.to_string(), value.to_string());
        } else {
            error!(
                "invalid kubevirt.spec.{field}: labels must be 63 characters or less, begin and end with \
                 alphanumeric characters, and contain only dot, hyphen or dash"
            );
        }
    };
    add(APP_VERSION_LABEL, config.product_version(), "productVersion");
    add(APP_PART_OF_LABEL, config.product_name(), "productName");
    add(APP_COMPONENT_LABEL, config.product_component(), "productComponent");
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PROP_PRODUCT_NAME, PROP_PRODUCT_VERSION};

    #[test]
    fn invalid_product_labels_are_dropped() {
        let mut config = DeploymentConfig::default();
        config
            .additional_properties
            .insert(PROP_PRODUCT_NAME.into(), "KubeVirt Suite!".into());
        config
            .additional_properties
            .insert(PROP_PRODUCT_VERSION.into(), "1.2.0".into());
        let labels = product_labels(&config);
        assert_eq!(labels.get(APP_VERSION_LABEL).map(String::as_str), Some("1.2.0"));
        assert!(!labels.contains_key(APP_PART_OF_LABEL));
    }
}
