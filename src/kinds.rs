use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding,
    ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use std::collections::BTreeMap;
use std::fmt;

use crate::crd::{ApiService, PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor};

pub static APP_LABEL: &str = "kubevirt.io";
pub static APP_VERSION_LABEL: &str = "app.kubernetes.io/version";
pub static APP_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub static APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub static APP_COMPONENT: &str = "kubevirt";
pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY_OPERATOR: &str = "virt-operator";
pub static MANAGED_BY_OPERATOR_OLD: &str = "kubevirt-operator";
pub static INSTALL_STRATEGY_LABEL: &str = "kubevirt.io/install-strategy";
pub static INSTALL_STRATEGY_VERSION_ANNOTATION: &str = "kubevirt.io/install-strategy-version";
pub static INSTALL_STRATEGY_REGISTRY_ANNOTATION: &str = "kubevirt.io/install-strategy-registry";
pub static INSTALL_STRATEGY_ID_ANNOTATION: &str = "kubevirt.io/install-strategy-identifier";
pub static INSTALL_STRATEGY_ENCODING_ANNOTATION: &str = "kubevirt.io/install-strategy-cm-encoding";
pub static CUSTOMIZER_ID_ANNOTATION: &str = "kubevirt.io/customizer-identifier";
pub static GENERATION_ANNOTATION: &str = "kubevirt.io/generation";
pub static COMPONENT_FINALIZER: &str = "kubevirt.io/virtOperatorFinalizer";

const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by in (virt-operator,kubevirt-operator)";

crate::managed_kinds! {
    ServiceAccount(ServiceAccount) => service_accounts, namespaced, selector: MANAGED_SELECTOR;
    ClusterRole(ClusterRole) => cluster_roles, cluster, selector: MANAGED_SELECTOR;
    ClusterRoleBinding(ClusterRoleBinding) => cluster_role_bindings, cluster, selector: MANAGED_SELECTOR;
    Role(Role) => roles, namespaced, selector: MANAGED_SELECTOR;
    RoleBinding(RoleBinding) => role_bindings, namespaced, selector: MANAGED_SELECTOR;
    Crd(CustomResourceDefinition) => crds, cluster, selector: MANAGED_SELECTOR;
    Service(Service) => services, namespaced, selector: MANAGED_SELECTOR;
    Deployment(Deployment) => deployments, namespaced, selector: MANAGED_SELECTOR;
    DaemonSet(DaemonSet) => daemon_sets, namespaced, selector: MANAGED_SELECTOR;
    ValidatingWebhook(ValidatingWebhookConfiguration) => validating_webhooks, cluster, selector: MANAGED_SELECTOR;
    MutatingWebhook(MutatingWebhookConfiguration) => mutating_webhooks, cluster, selector: MANAGED_SELECTOR;
    ApiService(ApiService) => api_services, cluster, selector: MANAGED_SELECTOR;
    Secret(Secret) => secrets, namespaced, selector: MANAGED_SELECTOR;
    ConfigMap(ConfigMap) => config_maps, namespaced,
        selector: "app.kubernetes.io/managed-by in (virt-operator,kubevirt-operator),!kubevirt.io/install-strategy";
    PodDisruptionBudget(PodDisruptionBudget) => pod_disruption_budgets, namespaced, selector: MANAGED_SELECTOR;
    Scc(SecurityContextConstraints) => sccs, cluster, selector: "";
    Route(Route) => routes, namespaced, selector: MANAGED_SELECTOR;
    ServiceMonitor(ServiceMonitor) => service_monitors, namespaced, selector: MANAGED_SELECTOR;
    PrometheusRule(PrometheusRule) => prometheus_rules, namespaced, selector: MANAGED_SELECTOR;
    ValidatingAdmissionPolicy(ValidatingAdmissionPolicy) => validating_admission_policies, cluster,
        selector: MANAGED_SELECTOR;
    ValidatingAdmissionPolicyBinding(ValidatingAdmissionPolicyBinding) => validating_admission_policy_bindings,
        cluster, selector: MANAGED_SELECTOR;
    InstallStrategyConfigMap(ConfigMap) => install_strategy_config_maps, namespaced,
        selector: "kubevirt.io/install-strategy";
    InstallStrategyJob(Job) => install_strategy_jobs, namespaced, selector: "kubevirt.io/install-strategy";
    Namespace(Namespace) => namespaces, cluster, selector: "";
    Pod(Pod) => pods, namespaced,
        selector: "kubevirt.io in (virt-api,virt-controller,virt-handler,virt-exportproxy)";
    Lease(Lease) => leases, namespaced, selector: "";
}

impl Kind {
    /// Resolves a Kubernetes `kind` to the first table row carrying it.
    ///
    /// Rows sharing a type (`ConfigMap` and `InstallStrategyConfigMap`) resolve to the
    /// first one, which is the row used for strategy content.
    pub fn from_api_kind(api_kind: &str) -> Option<Kind> {
        Kind::ALL.iter().copied().find(|k| k.api_kind() == api_kind)
    }

    /// Namespace the informer of this kind is restricted to, `None` watches all namespaces
    pub fn watch_namespace(self, operator_namespace: &str) -> Option<&str> {
        match self {
            Kind::InstallStrategyConfigMap | Kind::InstallStrategyJob | Kind::Pod | Kind::Lease => {
                Some(operator_namespace)
            }
            _ => None,
        }
    }

    /// Kinds whose creations and deletions are counted against the expectations.
    /// The rest only trigger a new pass.
    pub fn tracks_expectations(self) -> bool {
        !matches!(self, Kind::Namespace | Kind::Pod | Kind::Lease)
    }

    /// Kinds served by optional API groups that may be missing from the cluster
    pub fn is_optional(self) -> bool {
        matches!(self, Kind::Scc | Kind::Route | Kind::ServiceMonitor | Kind::PrometheusRule)
    }

    /// Kinds whose `metadata.generation` is tracked in `status.generations`
    pub fn tracks_generation(self) -> bool {
        matches!(
            self,
            Kind::Crd
                | Kind::Deployment
                | Kind::DaemonSet
                | Kind::ValidatingWebhook
                | Kind::MutatingWebhook
                | Kind::PodDisruptionBudget
                | Kind::ApiService
                | Kind::ServiceMonitor
                | Kind::PrometheusRule
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of an object within the kind table
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// `namespace/name`, or `name` for cluster scoped objects
    pub fn cache_key(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}/{}", self.name),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.cache_key())
    }
}

impl ManagedObject {
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.meta().annotations.clone().unwrap_or_default()
    }

    pub fn is_managed_by_operator(&self) -> bool {
        is_managed_by_operator(self.meta().labels.as_ref())
    }
}

pub fn is_managed_by_operator(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGED_BY_OPERATOR || v == MANAGED_BY_OPERATOR_OLD)
}
