//! Queries over the informer caches.
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::*;

use crate::crd::KubeVirt;
use crate::kinds::{
    APP_LABEL, INSTALL_STRATEGY_ID_ANNOTATION, INSTALL_STRATEGY_REGISTRY_ANNOTATION,
    INSTALL_STRATEGY_VERSION_ANNOTATION, Kind, ManagedObject,
};

pub use crate::kinds::{StoreWriters, Stores};

/// Kinds whose caches must drain before an uninstall counts as complete
pub const MANAGED_KINDS: &[Kind] = &[
    Kind::ServiceAccount,
    Kind::ClusterRole,
    Kind::ClusterRoleBinding,
    Kind::Role,
    Kind::RoleBinding,
    Kind::Crd,
    Kind::Service,
    Kind::Deployment,
    Kind::DaemonSet,
    Kind::ValidatingWebhook,
    Kind::MutatingWebhook,
    Kind::ApiService,
    Kind::Secret,
    Kind::ConfigMap,
    Kind::PodDisruptionBudget,
    Kind::Scc,
    Kind::Route,
    Kind::ServiceMonitor,
    Kind::PrometheusRule,
    Kind::ValidatingAdmissionPolicy,
    Kind::ValidatingAdmissionPolicyBinding,
];

impl Stores {
    /// Number of objects in `kind` the operator owns. SCCs are shared with the
    /// platform, so only the labelled ones count.
    pub fn managed_len(&self, kind: Kind) -> usize {
        match kind {
            Kind::Scc => self
                .list(Kind::Scc)
                .iter()
                .filter(|o| o.is_managed_by_operator())
                .count(),
            _ => self.len(kind),
        }
    }

    pub fn all_empty(&self) -> bool {
        MANAGED_KINDS.iter().all(|k| self.managed_len(*k) == 0)
    }

    pub fn managed_object_count(&self) -> usize {
        MANAGED_KINDS.iter().map(|k| self.managed_len(*k)).sum()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        match self.get(Kind::Deployment, Some(namespace), name) {
            Some(ManagedObject::Deployment(d)) => Some(d),
            _ => None,
        }
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        match self.get(Kind::DaemonSet, Some(namespace), name) {
            Some(ManagedObject::DaemonSet(d)) => Some(d),
            _ => None,
        }
    }

    fn component_pods(&self, namespace: &str, component: &str) -> Vec<Pod> {
        self.pods
            .state()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| p.labels().get(APP_LABEL).map(String::as_str) == Some(component))
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .map(|p| (**p).clone())
            .collect()
    }
}

fn pod_is_up_to_date(pod: &Pod, kv: &KubeVirt) -> bool {
    let status = kv.status_ref();
    let annotations = pod.annotations();
    let matches = |key: &str, want: &Option<String>| {
        annotations.get(key).map(String::as_str) == Some(want.as_deref().unwrap_or_default())
    };
    matches(INSTALL_STRATEGY_VERSION_ANNOTATION, &status.target_kube_virt_version)
        && matches(INSTALL_STRATEGY_REGISTRY_ANNOTATION, &status.target_kube_virt_registry)
        && matches(INSTALL_STRATEGY_ID_ANNOTATION, &status.target_deployment_id)
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
}

/// True when at least one pod of the component runs the target version and none is stale or unready
fn pods_ready(kv: &KubeVirt, stores: &Stores, namespace: &str, component: &str) -> bool {
    let pods = stores.component_pods(namespace, component);
    if pods.is_empty() {
        debug!("no pods found for {component}");
        return false;
    }
    for pod in &pods {
        if !pod_is_up_to_date(pod, kv) {
            debug!("pod {} is not at the target version", pod.name_any());
            return false;
        }
        if !pod_is_ready(pod) {
            debug!("pod {} is not ready yet", pod.name_any());
            return false;
        }
    }
    true
}

pub fn deployment_is_ready(kv: &KubeVirt, deployment: &Deployment, stores: &Stores) -> bool {
    let namespace = deployment.namespace().unwrap_or_default();
    let Some(cached) = stores.deployment(&namespace, &deployment.name_any()) else {
        return false;
    };
    let status = cached.status.unwrap_or_default();
    if status.replicas.unwrap_or_default() == 0 || status.ready_replicas.unwrap_or_default() == 0 {
        debug!("deployment {} has no ready replicas", deployment.name_any());
        return false;
    }
    pods_ready(kv, stores, &namespace, &deployment.name_any())
}

pub fn daemonset_is_ready(kv: &KubeVirt, daemonset: &DaemonSet, stores: &Stores) -> bool {
    let namespace = daemonset.namespace().unwrap_or_default();
    let Some(cached) = stores.daemon_set(&namespace, &daemonset.name_any()) else {
        return false;
    };
    let Some(status) = cached.status else {
        return false;
    };
    if status.desired_number_scheduled == 0 || status.number_ready != status.desired_number_scheduled {
        debug!("daemonset {} is not fully scheduled", daemonset.name_any());
        return false;
    }
    pods_ready(kv, stores, &namespace, &daemonset.name_any())
}
