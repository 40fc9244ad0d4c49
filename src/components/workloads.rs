use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use super::*;
use crate::config::DeploymentConfig;

fn selector(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), component.to_string())])
}

fn service(namespace: &str, name: &str, component: &str, port: i32, target: i32) -> Service {
    Service {
        metadata: object_meta(name, Some(namespace), component),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector(component)),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(target)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn all_services(namespace: &str, operator_namespace: &str) -> Vec<Service> {
    let mut metrics = service(namespace, "kubevirt-prometheus-metrics", "", 8443, 8443);
    if let Some(spec) = metrics.spec.as_mut() {
        spec.selector = Some(BTreeMap::from([(PROMETHEUS_LABEL.to_string(), "true".to_string())]));
        spec.cluster_ip = Some("None".to_string());
        if let Some(port) = spec.ports.as_mut().and_then(|p| p.first_mut()) {
            port.name = Some("metrics".to_string());
        }
    }
    vec![
        metrics,
        service(namespace, VIRT_API, VIRT_API, 443, 8443),
        service(namespace, VIRT_EXPORTPROXY, VIRT_EXPORTPROXY, 443, 8443),
        service(operator_namespace, "kubevirt-operator-webhook", VIRT_OPERATOR, 443, 8444),
    ]
}

fn container(name: &str, image: String, config: &DeploymentConfig, args: Vec<String>) -> Container {
    let mut env = vec![EnvVar {
        name: "KUBEVIRT_NAMESPACE".to_string(),
        value: None,
        value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
            field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                field_path: "metadata.namespace".to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }];
    env.extend(config.extra_env());
    Container {
        name: name.to_string(),
        image: Some(image),
        image_pull_policy: Some(config.image_pull_policy().to_string()),
        command: Some(vec![name.to_string()]),
        args: Some(args),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: 8443,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(8443),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(10),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                add: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_template(component: &str, service_account: &str, config: &DeploymentConfig, c: Container) -> PodTemplateSpec {
    let mut labels = selector(component);
    labels.insert(PROMETHEUS_LABEL.to_string(), "true".to_string());
    labels.extend(product_labels(config));
    let pull_secrets = config.image_pull_secrets();
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(component.to_string()),
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(service_account.to_string()),
            priority_class_name: Some("kubevirt-cluster-critical".to_string()),
            containers: vec![c],
            image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn deployment(
    namespace: &str,
    component: &str,
    service_account: &str,
    config: &DeploymentConfig,
    c: Container,
) -> Deployment {
    let mut metadata = object_meta(component, Some(namespace), component);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.extend(product_labels(config));
    }
    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(2),
            selector: LabelSelector {
                match_labels: Some(selector(component)),
                match_expressions: None,
            },
            template: pod_template(component, service_account, config, c),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn api_deployment(namespace: &str, config: &DeploymentConfig) -> Deployment {
    let image = config.image(VIRT_API, config.api_version());
    let args = vec!["--port".to_string(), "8443".to_string(), "-v".to_string(), config.verbosity().to_string()];
    deployment(namespace, VIRT_API, API_SERVICE_ACCOUNT, config, container(VIRT_API, image, config, args))
}

pub fn controller_deployment(namespace: &str, config: &DeploymentConfig) -> Deployment {
    let image = config.image(VIRT_CONTROLLER, config.controller_version());
    let args = vec![
        "--launcher-image".to_string(),
        config.image(VIRT_LAUNCHER, config.launcher_version()),
        "--exporter-image".to_string(),
        config.image(VIRT_EXPORTSERVER, config.export_server_version()),
        "--port".to_string(),
        "8443".to_string(),
        "-v".to_string(),
        config.verbosity().to_string(),
    ];
    deployment(
        namespace,
        VIRT_CONTROLLER,
        CONTROLLER_SERVICE_ACCOUNT,
        config,
        container(VIRT_CONTROLLER, image, config, args),
    )
}

pub fn export_proxy_deployment(namespace: &str, config: &DeploymentConfig) -> Deployment {
    let image = config.image(VIRT_EXPORTPROXY, config.export_proxy_version());
    let args = vec!["--port".to_string(), "8443".to_string(), "-v".to_string(), config.verbosity().to_string()];
    deployment(
        namespace,
        VIRT_EXPORTPROXY,
        EXPORTPROXY_SERVICE_ACCOUNT,
        config,
        container(VIRT_EXPORTPROXY, image, config, args),
    )
}

pub fn handler_daemonset(namespace: &str, config: &DeploymentConfig) -> DaemonSet {
    let image = config.image(VIRT_HANDLER, config.handler_version());
    let args = vec![
        "--port".to_string(),
        "8443".to_string(),
        "--hostname-override".to_string(),
        "$(NODE_NAME)".to_string(),
        "--launcher-image".to_string(),
        config.image(VIRT_LAUNCHER, config.launcher_version()),
        "-v".to_string(),
        config.verbosity().to_string(),
    ];
    let mut c = container(VIRT_HANDLER, image, config, args);
    // the handler manages node level resources
    c.security_context = Some(SecurityContext {
        privileged: Some(true),
        ..Default::default()
    });
    let mut template = pod_template(VIRT_HANDLER, HANDLER_SERVICE_ACCOUNT, config, c);
    if let Some(spec) = template.spec.as_mut() {
        spec.host_pid = Some(true);
        spec.security_context = None;
    }
    let mut metadata = object_meta(VIRT_HANDLER, Some(namespace), VIRT_HANDLER);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.extend(product_labels(config));
    }
    DaemonSet {
        metadata,
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector(VIRT_HANDLER)),
                match_expressions: None,
            },
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// PDB keeping one pod of a multi replica deployment available. Deployments with at
/// most one replica get none.
pub fn pdb_for_deployment(deployment: &Deployment) -> Option<PodDisruptionBudget> {
    let spec = deployment.spec.as_ref()?;
    if spec.replicas.unwrap_or(1) < 2 {
        return None;
    }
    let name = deployment.metadata.name.as_deref()?;
    let component = deployment
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(APP_LABEL))
        .map(String::as_str)
        .unwrap_or(name);
    Some(PodDisruptionBudget {
        metadata: object_meta(&format!("{name}-pdb"), deployment.metadata.namespace.as_deref(), component),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(spec.selector.clone()),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            registry: "quay.io/kubevirt".into(),
            kube_virt_version: "v1.2.0".into(),
            passthrough_env_vars: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn deployments_use_configured_images_and_env() {
        let d = controller_deployment("kubevirt", &config());
        let spec = d.spec.unwrap().template.spec.unwrap();
        let c = &spec.containers[0];
        assert_eq!(c.image.as_deref(), Some("quay.io/kubevirt/virt-controller:v1.2.0"));
        assert!(c.args.as_ref().unwrap().contains(&"quay.io/kubevirt/virt-launcher:v1.2.0".to_string()));
        assert!(c.env.as_ref().unwrap().iter().any(|e| e.name == "FOO"));
        assert_eq!(spec.service_account_name.as_deref(), Some(CONTROLLER_SERVICE_ACCOUNT));
    }

    #[test]
    fn pdb_only_for_multi_replica_deployments() {
        let mut d = api_deployment("kubevirt", &config());
        let pdb = pdb_for_deployment(&d).unwrap();
        assert_eq!(pdb.metadata.name.as_deref(), Some("virt-api-pdb"));
        assert_eq!(pdb.metadata.namespace.as_deref(), Some("kubevirt"));

        d.spec.as_mut().unwrap().replicas = Some(1);
        assert!(pdb_for_deployment(&d).is_none());
    }

    #[test]
    fn operator_webhook_service_lives_in_operator_namespace() {
        let services = all_services("kubevirt", "kubevirt-operator");
        let svc = services
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some("kubevirt-operator-webhook"))
            .unwrap();
        assert_eq!(svc.metadata.namespace.as_deref(), Some("kubevirt-operator"));
    }
}
