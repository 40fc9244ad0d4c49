//! Install strategies: the complete, immutable set of objects for one deployment
//! configuration.
use k8s_openapi::api::admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::components::{VIRT_API, VIRT_EXPORTPROXY};
use crate::crd::{ApiService, PrometheusRule, SecurityContextConstraints, ServiceMonitor};
use crate::kinds::{Kind, ManagedObject};
use crate::{Error, Result};

pub mod cache;
pub mod dump;
pub mod generate;
pub mod job;

pub use cache::StrategyCache;
pub use dump::{
    dump_install_strategy_to_bytes, dump_install_strategy_to_config_map, load_install_strategy_from_bytes,
    load_install_strategy_from_cache, new_install_strategy_config_map,
};
pub use generate::generate_current_install_strategy;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Strategy {
    pub(crate) service_accounts: Vec<ServiceAccount>,
    pub(crate) cluster_roles: Vec<ClusterRole>,
    pub(crate) cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub(crate) roles: Vec<Role>,
    pub(crate) role_bindings: Vec<RoleBinding>,
    pub(crate) crds: Vec<CustomResourceDefinition>,
    pub(crate) services: Vec<Service>,
    pub(crate) deployments: Vec<Deployment>,
    pub(crate) daemon_sets: Vec<DaemonSet>,
    pub(crate) validating_webhooks: Vec<ValidatingWebhookConfiguration>,
    pub(crate) mutating_webhooks: Vec<MutatingWebhookConfiguration>,
    pub(crate) api_services: Vec<ApiService>,
    pub(crate) certificate_secrets: Vec<Secret>,
    pub(crate) sccs: Vec<SecurityContextConstraints>,
    pub(crate) service_monitors: Vec<ServiceMonitor>,
    pub(crate) prometheus_rules: Vec<PrometheusRule>,
    pub(crate) config_maps: Vec<ConfigMap>,
}

impl Strategy {
    pub fn service_accounts(&self) -> &[ServiceAccount] {
        &self.service_accounts
    }

    pub fn cluster_roles(&self) -> &[ClusterRole] {
        &self.cluster_roles
    }

    pub fn cluster_role_bindings(&self) -> &[ClusterRoleBinding] {
        &self.cluster_role_bindings
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role_bindings(&self) -> &[RoleBinding] {
        &self.role_bindings
    }

    pub fn crds(&self) -> &[CustomResourceDefinition] {
        &self.crds
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    fn deployments_where(&self, pred: impl Fn(&str) -> bool) -> Vec<&Deployment> {
        self.deployments
            .iter()
            .filter(|d| pred(d.metadata.name.as_deref().unwrap_or_default()))
            .collect()
    }

    pub fn api_deployments(&self) -> Vec<&Deployment> {
        self.deployments_where(|name| name.contains(VIRT_API))
    }

    /// Deployments other than virt-api and the export proxy
    pub fn controller_deployments(&self) -> Vec<&Deployment> {
        self.deployments_where(|name| !name.contains(VIRT_API) && !name.contains(VIRT_EXPORTPROXY))
    }

    pub fn export_proxy_deployments(&self) -> Vec<&Deployment> {
        self.deployments_where(|name| name.contains(VIRT_EXPORTPROXY))
    }

    pub fn daemon_sets(&self) -> &[DaemonSet] {
        &self.daemon_sets
    }

    pub fn validating_webhooks(&self) -> &[ValidatingWebhookConfiguration] {
        &self.validating_webhooks
    }

    pub fn mutating_webhooks(&self) -> &[MutatingWebhookConfiguration] {
        &self.mutating_webhooks
    }

    pub fn api_services(&self) -> &[ApiService] {
        &self.api_services
    }

    pub fn certificate_secrets(&self) -> &[Secret] {
        &self.certificate_secrets
    }

    pub fn sccs(&self) -> &[SecurityContextConstraints] {
        &self.sccs
    }

    pub fn service_monitors(&self) -> &[ServiceMonitor] {
        &self.service_monitors
    }

    pub fn prometheus_rules(&self) -> &[PrometheusRule] {
        &self.prometheus_rules
    }

    pub fn config_maps(&self) -> &[ConfigMap] {
        &self.config_maps
    }

    /// Every object in dump order
    pub fn objects(&self) -> Vec<ManagedObject> {
        let mut out = Vec::new();
        out.extend(self.service_accounts.iter().cloned().map(ManagedObject::ServiceAccount));
        out.extend(self.cluster_roles.iter().cloned().map(ManagedObject::ClusterRole));
        out.extend(self.cluster_role_bindings.iter().cloned().map(ManagedObject::ClusterRoleBinding));
        out.extend(self.roles.iter().cloned().map(ManagedObject::Role));
        out.extend(self.role_bindings.iter().cloned().map(ManagedObject::RoleBinding));
        out.extend(self.crds.iter().cloned().map(ManagedObject::Crd));
        out.extend(self.services.iter().cloned().map(ManagedObject::Service));
        out.extend(self.certificate_secrets.iter().cloned().map(ManagedObject::Secret));
        out.extend(self.validating_webhooks.iter().cloned().map(ManagedObject::ValidatingWebhook));
        out.extend(self.mutating_webhooks.iter().cloned().map(ManagedObject::MutatingWebhook));
        out.extend(self.api_services.iter().cloned().map(ManagedObject::ApiService));
        out.extend(self.deployments.iter().cloned().map(ManagedObject::Deployment));
        out.extend(self.daemon_sets.iter().cloned().map(ManagedObject::DaemonSet));
        out.extend(self.sccs.iter().cloned().map(ManagedObject::Scc));
        out.extend(self.service_monitors.iter().cloned().map(ManagedObject::ServiceMonitor));
        out.extend(self.prometheus_rules.iter().cloned().map(ManagedObject::PrometheusRule));
        out.extend(self.config_maps.iter().cloned().map(ManagedObject::ConfigMap));
        out
    }

    /// Adds `object` to the vector of its kind. Kinds that never belong to a strategy are
    /// rejected.
    pub fn push(&mut self, object: ManagedObject) -> Result<()> {
        match object {
            ManagedObject::ServiceAccount(o) => self.service_accounts.push(o),
            ManagedObject::ClusterRole(o) => self.cluster_roles.push(o),
            ManagedObject::ClusterRoleBinding(o) => self.cluster_role_bindings.push(o),
            ManagedObject::Role(o) => self.roles.push(o),
            ManagedObject::RoleBinding(o) => self.role_bindings.push(o),
            ManagedObject::Crd(o) => self.crds.push(o),
            ManagedObject::Service(o) => self.services.push(o),
            ManagedObject::Deployment(o) => self.deployments.push(o),
            ManagedObject::DaemonSet(o) => self.daemon_sets.push(o),
            ManagedObject::ValidatingWebhook(o) => self.validating_webhooks.push(o),
            ManagedObject::MutatingWebhook(o) => self.mutating_webhooks.push(o),
            ManagedObject::ApiService(o) => self.api_services.push(o),
            ManagedObject::Secret(o) => self.certificate_secrets.push(o),
            ManagedObject::Scc(o) => self.sccs.push(o),
            ManagedObject::ServiceMonitor(o) => self.service_monitors.push(o),
            ManagedObject::PrometheusRule(o) => self.prometheus_rules.push(o),
            ManagedObject::ConfigMap(o) => self.config_maps.push(o),
            other => return Err(Error::UnknownKind(other.kind().api_kind().to_string())),
        }
        Ok(())
    }

    /// Whether the strategy has an object of `kind` named `name`. Namespaces are ignored
    /// for cluster scoped kinds.
    pub fn contains(&self, kind: Kind, namespace: Option<&str>, name: &str) -> bool {
        self.objects().iter().any(|o| {
            o.kind() == kind && o.name() == name && (!kind.namespaced() || o.namespace() == namespace)
        })
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
