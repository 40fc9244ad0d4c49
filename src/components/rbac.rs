use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use std::collections::BTreeMap;

use super::*;
use crate::kinds::APP_COMPONENT;

/// Every RBAC object of an installation, grouped by kind
#[derive(Clone, Debug, Default)]
pub struct RbacObjects {
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_roles: Vec<ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |v: &[&str]| Some(v.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    PolicyRule {
        api_groups: strings(groups),
        resources: strings(resources),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

const ALL: &[&str] = &["*"];
const READ: &[&str] = &["get", "list", "watch"];
const WRITE: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete", "deletecollection"];

const VIRT_GROUPS: &[&str] = &["kubevirt.io", "snapshot.kubevirt.io", "export.kubevirt.io"];
const VIRT_RESOURCES: &[&str] = &[
    "virtualmachineinstances",
    "virtualmachines",
    "virtualmachineinstancereplicasets",
    "virtualmachineinstancepresets",
    "virtualmachineinstancemigrations",
    "virtualmachinesnapshots",
    "virtualmachinesnapshotcontents",
    "virtualmachinerestores",
    "virtualmachineexports",
];

fn cluster_role(name: &str, component: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: object_meta(name, None, component),
        rules: Some(rules),
        aggregation_rule: None,
    }
}

fn subject(namespace: &str, service_account: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn cluster_role_binding(name: &str, role: &str, component: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: object_meta(name, None, component),
        role_ref: role_ref("ClusterRole", role),
        subjects: Some(subjects),
    }
}

fn role(namespace: &str, name: &str, component: &str, rules: Vec<PolicyRule>) -> Role {
    Role {
        metadata: object_meta(name, Some(namespace), component),
        rules: Some(rules),
    }
}

fn role_binding(namespace: &str, name: &str, component: &str, subjects: Vec<Subject>) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(name, Some(namespace), component),
        role_ref: role_ref("Role", name),
        subjects: Some(subjects),
    }
}

fn service_account(namespace: &str, name: &str, component: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(name, Some(namespace), component),
        ..Default::default()
    }
}

/// Aggregated user facing roles
fn user_roles() -> Vec<ClusterRole> {
    let aggregate = |name: &str, aggregate_to: &str, verbs: &[&str]| {
        let mut role = cluster_role(name, APP_COMPONENT, vec![rule(VIRT_GROUPS, VIRT_RESOURCES, verbs)]);
        let labels = role.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(format!("rbac.authorization.k8s.io/aggregate-to-{aggregate_to}"), "true".to_string());
        role
    };
    let default = cluster_role(
        "kubevirt.io:default",
        APP_COMPONENT,
        vec![rule(&["subresources.kubevirt.io"], &["version", "guestfs"], &["get", "list"])],
    );
    vec![
        default,
        aggregate("kubevirt.io:admin", "admin", WRITE),
        aggregate("kubevirt.io:edit", "edit", WRITE),
        aggregate("kubevirt.io:view", "view", READ),
    ]
}

struct ComponentRbac {
    component: &'static str,
    service_account: &'static str,
    cluster_rules: fn() -> Vec<PolicyRule>,
    namespaced_rules: fn() -> Vec<PolicyRule>,
}

const COMPONENTS: &[ComponentRbac] = &[
    ComponentRbac {
        component: VIRT_API,
        service_account: API_SERVICE_ACCOUNT,
        cluster_rules: || {
            vec![
                rule(&[""], &["namespaces", "limitranges"], READ),
                rule(&["authorization.k8s.io"], &["subjectaccessreviews"], &["create"]),
                rule(VIRT_GROUPS, VIRT_RESOURCES, READ),
            ]
        },
        namespaced_rules: || vec![rule(&[""], &["configmaps"], READ)],
    },
    ComponentRbac {
        component: VIRT_CONTROLLER,
        service_account: CONTROLLER_SERVICE_ACCOUNT,
        cluster_rules: || {
            vec![
                rule(&[""], &["pods", "persistentvolumeclaims", "events", "nodes"], WRITE),
                rule(&["apps"], &["controllerrevisions"], WRITE),
                rule(VIRT_GROUPS, ALL, ALL),
            ]
        },
        namespaced_rules: || vec![rule(&["coordination.k8s.io"], &["leases"], WRITE)],
    },
    ComponentRbac {
        component: VIRT_HANDLER,
        service_account: HANDLER_SERVICE_ACCOUNT,
        cluster_rules: || {
            vec![
                rule(&["kubevirt.io"], &["virtualmachineinstances"], &["get", "list", "watch", "update", "patch"]),
                rule(&[""], &["nodes"], &["get", "list", "watch", "patch"]),
                rule(&[""], &["events"], &["create", "patch"]),
            ]
        },
        namespaced_rules: || vec![rule(&[""], &["configmaps"], READ)],
    },
    ComponentRbac {
        component: VIRT_EXPORTPROXY,
        service_account: EXPORTPROXY_SERVICE_ACCOUNT,
        cluster_rules: || vec![rule(&["export.kubevirt.io"], &["virtualmachineexports"], READ)],
        namespaced_rules: || vec![rule(&[""], &["configmaps"], READ)],
    },
];

/// RBAC for the user roles and every component in `namespace`
pub fn all_rbac(namespace: &str) -> RbacObjects {
    let mut objects = RbacObjects {
        cluster_roles: user_roles(),
        cluster_role_bindings: vec![cluster_role_binding(
            "kubevirt.io:default",
            "kubevirt.io:default",
            APP_COMPONENT,
            vec![Subject {
                kind: "Group".to_string(),
                name: "system:authenticated".to_string(),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                namespace: None,
            }],
        )],
        ..Default::default()
    };

    for c in COMPONENTS {
        let name = c.service_account;
        objects.service_accounts.push(service_account(namespace, name, c.component));
        objects.cluster_roles.push(cluster_role(name, c.component, (c.cluster_rules)()));
        objects.cluster_role_bindings.push(cluster_role_binding(
            name,
            name,
            c.component,
            vec![subject(namespace, name)],
        ));
        objects.roles.push(role(namespace, name, c.component, (c.namespaced_rules)()));
        objects
            .role_bindings
            .push(role_binding(namespace, name, c.component, vec![subject(namespace, name)]));
    }

    objects.cluster_role_bindings.push(cluster_role_binding(
        "kubevirt-apiserver-auth-delegator",
        "system:auth-delegator",
        VIRT_API,
        vec![subject(namespace, API_SERVICE_ACCOUNT)],
    ));
    objects
}

/// Grants the prometheus service account read access to the metrics endpoints
pub fn monitoring_rbac(namespace: &str, monitor_namespace: &str, monitor_account: &str) -> (Role, RoleBinding) {
    let name = "kubevirt-monitoring";
    (
        role(
            namespace,
            name,
            APP_COMPONENT,
            vec![rule(&[""], &["services", "endpoints", "pods"], READ)],
        ),
        role_binding(namespace, name, APP_COMPONENT, vec![subject(monitor_namespace, monitor_account)]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_component_has_a_bound_service_account() {
        let rbac = all_rbac("kubevirt");
        assert_eq!(rbac.service_accounts.len(), COMPONENTS.len());
        for sa in &rbac.service_accounts {
            let name = sa.metadata.name.as_deref().unwrap();
            assert!(rbac
                .cluster_role_bindings
                .iter()
                .any(|b| b.role_ref.name == name
                    && b.subjects.as_ref().unwrap()[0].namespace.as_deref() == Some("kubevirt")));
            assert!(rbac.role_bindings.iter().any(|b| b.role_ref.name == name));
        }
    }

    #[test]
    fn user_roles_aggregate() {
        let rbac = all_rbac("kubevirt");
        let view = rbac
            .cluster_roles
            .iter()
            .find(|r| r.metadata.name.as_deref() == Some("kubevirt.io:view"))
            .unwrap();
        assert_eq!(
            view.metadata.labels.as_ref().unwrap()["rbac.authorization.k8s.io/aggregate-to-view"],
            "true"
        );
    }
}
