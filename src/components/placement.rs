//! Merges user supplied node placement into generated pod specs.
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
    PreferredSchedulingTerm, Toleration,
};
use std::collections::BTreeMap;

use crate::crd::ComponentConfig;

pub static KUBERNETES_OS_LABEL: &str = "kubernetes.io/os";
pub static KUBERNETES_OS_LINUX: &str = "linux";
pub static CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub static MASTER_LABEL: &str = "node-role.kubernetes.io/master";
pub static WORKER_LABEL: &str = "node-role.kubernetes.io/worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePlacementPolicy {
    AnyNode,
    /// Used when the user gave no placement for pods that belong on the control plane
    RequireControlPlanePreferNonWorker,
}

fn exists(key: &str, operator: &str) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values: None,
    }
}

fn control_plane_affinity() -> Affinity {
    let term = |key: &str| NodeSelectorTerm {
        match_expressions: Some(vec![exists(key, "Exists")]),
        match_fields: None,
    };
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![term(CONTROL_PLANE_LABEL), term(MASTER_LABEL)],
            }),
            preferred_during_scheduling_ignored_during_execution: Some(vec![PreferredSchedulingTerm {
                weight: 100,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![exists(WORKER_LABEL, "DoesNotExist")]),
                    match_fields: None,
                },
            }]),
        }),
        ..Default::default()
    }
}

fn control_plane_tolerations() -> Vec<Toleration> {
    [CONTROL_PLANE_LABEL, MASTER_LABEL]
        .iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        })
        .collect()
}

fn append<T: Clone + PartialEq>(target: &mut Option<Vec<T>>, extra: &Option<Vec<T>>) {
    let Some(extra) = extra else { return };
    let target = target.get_or_insert_with(Vec::new);
    for item in extra {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn merge_affinity(target: &mut Affinity, extra: &Affinity) {
    if let Some(extra_node) = &extra.node_affinity {
        let node = target.node_affinity.get_or_insert_with(NodeAffinity::default);
        if let Some(extra_required) = &extra_node.required_during_scheduling_ignored_during_execution {
            let required = node
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(NodeSelector::default);
            for term in &extra_required.node_selector_terms {
                if !required.node_selector_terms.contains(term) {
                    required.node_selector_terms.push(term.clone());
                }
            }
        }
        append(
            &mut node.preferred_during_scheduling_ignored_during_execution,
            &extra_node.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(extra_pod) = &extra.pod_affinity {
        let pod = target.pod_affinity.get_or_insert_with(Default::default);
        append(
            &mut pod.required_during_scheduling_ignored_during_execution,
            &extra_pod.required_during_scheduling_ignored_during_execution,
        );
        append(
            &mut pod.preferred_during_scheduling_ignored_during_execution,
            &extra_pod.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(extra_anti) = &extra.pod_anti_affinity {
        let anti = target.pod_anti_affinity.get_or_insert_with(Default::default);
        append(
            &mut anti.required_during_scheduling_ignored_during_execution,
            &extra_anti.required_during_scheduling_ignored_during_execution,
        );
        append(
            &mut anti.preferred_during_scheduling_ignored_during_execution,
            &extra_anti.preferred_during_scheduling_ignored_during_execution,
        );
    }
}

/// Applies `config`'s node placement to `pod_spec`. Existing selectors win over injected
/// ones; affinity terms and tolerations are appended when not already present.
pub fn inject_placement_metadata(
    config: Option<&ComponentConfig>,
    pod_spec: &mut PodSpec,
    policy: NodePlacementPolicy,
) {
    let selector = pod_spec.node_selector.get_or_insert_with(BTreeMap::new);
    selector
        .entry(KUBERNETES_OS_LABEL.to_string())
        .or_insert_with(|| KUBERNETES_OS_LINUX.to_string());

    let Some(placement) = config.and_then(|c| c.node_placement.as_ref()) else {
        if policy == NodePlacementPolicy::RequireControlPlanePreferNonWorker {
            merge_affinity(pod_spec.affinity.get_or_insert_with(Affinity::default), &control_plane_affinity());
            append(&mut pod_spec.tolerations, &Some(control_plane_tolerations()));
        }
        return;
    };

    if let Some(extra) = &placement.node_selector {
        for (k, v) in extra {
            selector.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    if let Some(extra) = &placement.affinity {
        match pod_spec.affinity.as_mut() {
            Some(affinity) => merge_affinity(affinity, extra),
            None => pod_spec.affinity = Some(extra.clone()),
        }
    }
    append(&mut pod_spec.tolerations, &placement.tolerations);
}
