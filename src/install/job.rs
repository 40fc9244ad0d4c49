//! The job that runs the operator image in dump mode to produce a missing strategy.
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, PodSpec, PodTemplateSpec, SeccompProfile, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::components::placement::{NodePlacementPolicy, inject_placement_metadata};
use crate::components::{OPERATOR_SERVICE_ACCOUNT, VIRT_OPERATOR};
use crate::config::{
    DeploymentConfig, OPERATOR_IMAGE_ENV, TARGET_DEPLOYMENT_CONFIG_ENV, TARGET_IMAGE_PULL_POLICY_ENV,
    TARGET_INSTALL_NAMESPACE_ENV,
};
use crate::crd::ComponentConfig;
use crate::kinds::{
    APP_LABEL, INSTALL_STRATEGY_ID_ANNOTATION, INSTALL_STRATEGY_LABEL, INSTALL_STRATEGY_REGISTRY_ANNOTATION,
    INSTALL_STRATEGY_VERSION_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_OPERATOR,
};
use crate::Result;

pub static JOB_CONTAINER_NAME: &str = "install-strategy-upload";
pub static JOB_POD_APP_LABEL: &str = "virt-operator-strategy-dumper";
pub static ALLOW_CLUSTER_SERVICES_LABEL: &str = "np.kubevirt.io/allow-access-cluster-services";

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

pub fn generate_install_strategy_job(
    config: &DeploymentConfig,
    operator_namespace: &str,
    infra: Option<&ComponentConfig>,
) -> Result<Job> {
    let image = config.image(VIRT_OPERATOR, config.operator_version());
    let mut env_vars = vec![
        env(OPERATOR_IMAGE_ENV, image.clone()),
        env(TARGET_INSTALL_NAMESPACE_ENV, config.namespace.clone()),
        env(TARGET_IMAGE_PULL_POLICY_ENV, config.image_pull_policy()),
        env(TARGET_DEPLOYMENT_CONFIG_ENV, config.json()?),
    ];
    env_vars.extend(config.extra_env());

    let mut pod_spec = PodSpec {
        service_account_name: Some(OPERATOR_SERVICE_ACCOUNT.to_string()),
        restart_policy: Some("Never".to_string()),
        containers: vec![Container {
            name: JOB_CONTAINER_NAME.to_string(),
            image: Some(image),
            image_pull_policy: Some(config.image_pull_policy().to_string()),
            command: Some(vec![VIRT_OPERATOR.to_string(), "--dump-install-strategy".to_string()]),
            env: Some(env_vars),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    localhost_profile: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    };
    let pull_secrets = config.image_pull_secrets();
    if !pull_secrets.is_empty() {
        pod_spec.image_pull_secrets = Some(pull_secrets);
    }
    inject_placement_metadata(infra, &mut pod_spec, NodePlacementPolicy::RequireControlPlanePreferNonWorker);

    Ok(Job {
        metadata: ObjectMeta {
            namespace: Some(operator_namespace.to_string()),
            generate_name: Some(format!("kubevirt-{}-job", config.deployment_id())),
            labels: Some(BTreeMap::from([
                (APP_LABEL.to_string(), String::new()),
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_OPERATOR.to_string()),
                (INSTALL_STRATEGY_LABEL.to_string(), String::new()),
            ])),
            annotations: Some(BTreeMap::from([
                (INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), config.kube_virt_version.clone()),
                (INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(), config.registry.clone()),
                (INSTALL_STRATEGY_ID_ANNOTATION.to_string(), config.deployment_id().to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([
                        (APP_LABEL.to_string(), JOB_POD_APP_LABEL.to_string()),
                        (ALLOW_CLUSTER_SERVICES_LABEL.to_string(), "true".to_string()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Id annotation of a strategy job, empty when absent
pub fn job_deployment_id(job: &Job) -> &str {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INSTALL_STRATEGY_ID_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default()
}

pub fn job_completed(job: &Job) -> bool {
    job.status.as_ref().is_some_and(|s| s.completion_time.is_some())
}
