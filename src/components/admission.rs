use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use super::*;
use crate::crd::ApiService;

/// Generate name prefix of the webhook that blocks new CRDs until virt-api is rolled over
pub static TEMPORARY_WEBHOOK_PREFIX: &str = "virt-operator-tmp-webhook";
pub static OPERATOR_WEBHOOK_SERVICE: &str = "kubevirt-operator-webhook";

fn client_config(namespace: &str, service: &str, path: &str) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: service.to_string(),
            namespace: namespace.to_string(),
            path: Some(path.to_string()),
            port: Some(443),
        }),
        ca_bundle: None,
        url: None,
    }
}

fn rules(group: &str, resources: &[&str], operations: &[&str]) -> Vec<RuleWithOperations> {
    vec![RuleWithOperations {
        api_groups: Some(vec![group.to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        operations: Some(operations.iter().map(|o| o.to_string()).collect()),
        scope: None,
    }]
}

fn validating(name: &str, namespace: &str, service: &str, path: &str, rules: Vec<RuleWithOperations>) -> ValidatingWebhook {
    ValidatingWebhook {
        name: name.to_string(),
        admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
        client_config: client_config(namespace, service, path),
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        rules: Some(rules),
        ..Default::default()
    }
}

pub fn operator_validating_webhook(operator_namespace: &str) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: object_meta("virt-operator-validator", None, VIRT_OPERATOR),
        webhooks: Some(vec![validating(
            "kubevirt-update-validator.kubevirt.io",
            operator_namespace,
            OPERATOR_WEBHOOK_SERVICE,
            "/kubevirt-validate-update",
            rules("kubevirt.io", &["kubevirts"], &["UPDATE", "DELETE"]),
        )]),
    }
}

pub fn api_validating_webhook(namespace: &str) -> ValidatingWebhookConfiguration {
    let webhook = |name: &str, resource: &str| {
        validating(
            &format!("{name}-validator.kubevirt.io"),
            namespace,
            VIRT_API,
            &format!("/{name}-validate"),
            rules("kubevirt.io", &[resource], &["CREATE", "UPDATE"]),
        )
    };
    ValidatingWebhookConfiguration {
        metadata: object_meta("virt-api-validator", None, VIRT_API),
        webhooks: Some(vec![
            webhook("virtualmachineinstances-create", "virtualmachineinstances"),
            webhook("virtualmachine", "virtualmachines"),
            webhook("virtualmachinereplicaset", "virtualmachineinstancereplicasets"),
            webhook("migration-create", "virtualmachineinstancemigrations"),
        ]),
    }
}

pub fn api_mutating_webhook(namespace: &str) -> MutatingWebhookConfiguration {
    let webhook = |name: &str, resource: &str| MutatingWebhook {
        name: format!("{name}-mutator.kubevirt.io"),
        admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
        client_config: client_config(namespace, VIRT_API, &format!("/{name}-mutate")),
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        rules: Some(rules("kubevirt.io", &[resource], &["CREATE"])),
        ..Default::default()
    };
    MutatingWebhookConfiguration {
        metadata: object_meta("virt-api-mutator", None, VIRT_API),
        webhooks: Some(vec![
            webhook("virtualmachineinstances", "virtualmachineinstances"),
            webhook("virtualmachines", "virtualmachines"),
            webhook("migrations", "virtualmachineinstancemigrations"),
        ]),
    }
}

pub fn api_services(namespace: &str) -> Vec<ApiService> {
    ["v1", "v1alpha3"]
        .iter()
        .map(|version| {
            let mut svc = ApiService::new(&format!("{version}.subresources.kubevirt.io")).with_field(
                "spec",
                json!({
                    "service": { "name": VIRT_API, "namespace": namespace, "port": 443 },
                    "group": "subresources.kubevirt.io",
                    "version": version,
                    "groupPriorityMinimum": 1000,
                    "versionPriority": 15,
                }),
            );
            svc.metadata = object_meta(&format!("{version}.subresources.kubevirt.io"), None, VIRT_API);
            svc
        })
        .collect()
}

/// Webhook rejecting creation of resources whose CRD is new in this installation, so
/// nothing is admitted before the matching virt-api serves it. `None` when every CRD
/// already exists.
pub fn temporary_validating_webhook(
    namespace: &str,
    new_crds: &[&CustomResourceDefinition],
) -> Option<ValidatingWebhookConfiguration> {
    if new_crds.is_empty() {
        return None;
    }
    let webhooks = new_crds
        .iter()
        .map(|crd| {
            let name = crd.metadata.name.as_deref().unwrap_or_default();
            let mut rule = rules(&crd.spec.group, &[crd.spec.names.plural.as_str()], &["CREATE"]);
            rule[0].api_versions = Some(vec!["v1".to_string(), "v1alpha3".to_string()]);
            validating(
                &format!("{name}-tmp-validator"),
                namespace,
                "fake-validation-service",
                &format!("/fake-path/{name}"),
                rule,
            )
        })
        .collect();
    Some(ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            generate_name: Some(TEMPORARY_WEBHOOK_PREFIX.to_string()),
            ..Default::default()
        },
        webhooks: Some(webhooks),
    })
}

pub fn is_temporary_webhook(meta: &ObjectMeta) -> bool {
    let prefixed = |s: &Option<String>| s.as_deref().is_some_and(|s| s.starts_with(TEMPORARY_WEBHOOK_PREFIX));
    prefixed(&meta.name) || prefixed(&meta.generate_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::crds::all_crds;

    #[test]
    fn temporary_webhook_covers_only_new_crds() {
        let crds = all_crds();
        assert!(temporary_validating_webhook("kubevirt", &[]).is_none());
        let wh = temporary_validating_webhook("kubevirt", &[&crds[0], &crds[1]]).unwrap();
        assert!(is_temporary_webhook(&wh.metadata));
        let hooks = wh.webhooks.unwrap();
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].name, "virtualmachineinstances.kubevirt.io-tmp-validator");
        let svc = hooks[0].client_config.service.as_ref().unwrap();
        assert_eq!(svc.name, "fake-validation-service");
        assert_eq!(svc.path.as_deref(), Some("/fake-path/virtualmachineinstances.kubevirt.io"));
    }

    #[test]
    fn api_services_point_at_virt_api() {
        let services = api_services("kubevirt");
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].spec().unwrap()["service"]["name"], VIRT_API);
        assert_eq!(services[0].metadata.labels.as_ref().unwrap()[APP_LABEL], VIRT_API);
    }
}
