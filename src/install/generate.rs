use tracing::*;

use super::Strategy;
use crate::components::{admission, certs, crds, monitoring, rbac, workloads};
use crate::config::DeploymentConfig;
use crate::Result;

/// Builds the strategy for `config`. Monitoring objects are only included when a
/// monitoring namespace was found by the caller.
pub fn generate_current_install_strategy(
    config: &DeploymentConfig,
    monitor_namespace: Option<&str>,
    service_monitor_namespace: Option<&str>,
    operator_namespace: &str,
) -> Result<Strategy> {
    let namespace = config.namespace.as_str();
    let mut strategy = Strategy {
        crds: crds::all_crds(),
        ..Default::default()
    };

    let rbac = rbac::all_rbac(namespace);
    strategy.service_accounts = rbac.service_accounts;
    strategy.cluster_roles = rbac.cluster_roles;
    strategy.cluster_role_bindings = rbac.cluster_role_bindings;
    strategy.roles = rbac.roles;
    strategy.role_bindings = rbac.role_bindings;

    match monitor_namespace {
        Some(monitor_ns) => {
            let (role, binding) = rbac::monitoring_rbac(namespace, monitor_ns, config.monitor_service_account());
            strategy.roles.push(role);
            strategy.role_bindings.push(binding);
            let sm_ns = service_monitor_namespace.unwrap_or(monitor_ns);
            strategy.service_monitors.push(monitoring::service_monitor(namespace, sm_ns));
            strategy.prometheus_rules.push(monitoring::prometheus_rule(namespace));
        }
        None => warn!(
            "failed to create service monitor resources because namespace {} does not exist",
            config.monitor_namespace()
        ),
    }

    strategy.validating_webhooks = vec![
        admission::operator_validating_webhook(operator_namespace),
        admission::api_validating_webhook(namespace),
    ];
    strategy.mutating_webhooks = vec![admission::api_mutating_webhook(namespace)];
    strategy.api_services = admission::api_services(namespace);

    strategy.services = workloads::all_services(namespace, operator_namespace);
    strategy.deployments = vec![
        workloads::api_deployment(namespace, config),
        workloads::controller_deployment(namespace, config),
        workloads::export_proxy_deployment(namespace, config),
    ];
    strategy.daemon_sets = vec![workloads::handler_daemonset(namespace, config)];

    strategy.certificate_secrets = certs::all_secrets(namespace, operator_namespace);
    strategy.config_maps = certs::all_config_maps(operator_namespace);
    strategy.sccs = monitoring::all_sccs(namespace);

    debug!("generated install strategy with {} objects", strategy.len());
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            namespace: "kubevirt".into(),
            registry: "quay.io/kubevirt".into(),
            kube_virt_version: "v1.2.0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn monitoring_objects_need_a_namespace() {
        let without = generate_current_install_strategy(&config(), None, None, "kubevirt").unwrap();
        assert!(without.service_monitors().is_empty());
        assert!(without.prometheus_rules().is_empty());

        let with = generate_current_install_strategy(&config(), Some("mon"), Some("sm"), "kubevirt").unwrap();
        assert_eq!(with.service_monitors()[0].metadata.namespace.as_deref(), Some("sm"));
        assert_eq!(with.prometheus_rules().len(), 1);
        assert_eq!(with.roles().len(), without.roles().len() + 1);
    }

    #[test]
    fn generation_is_deterministic() {
        let a = generate_current_install_strategy(&config(), Some("mon"), None, "kubevirt").unwrap();
        let b = generate_current_install_strategy(&config(), Some("mon"), None, "kubevirt").unwrap();
        assert_eq!(a, b);
    }
}
