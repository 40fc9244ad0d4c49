use serde_json::json;

use super::*;
use crate::crd::{PrometheusRule, SecurityContextConstraints, ServiceMonitor};
use crate::kinds::APP_COMPONENT;

pub static SERVICE_MONITOR_NAME: &str = "kubevirt";
pub static PROMETHEUS_RULE_NAME: &str = "prometheus-kubevirt-rules";

pub fn service_monitor(namespace: &str, monitor_namespace: &str) -> ServiceMonitor {
    let mut sm = ServiceMonitor::new(SERVICE_MONITOR_NAME).with_field(
        "spec",
        json!({
            "namespaceSelector": { "matchNames": [namespace] },
            "selector": { "matchLabels": { PROMETHEUS_LABEL: "true" } },
            "endpoints": [{
                "port": "metrics",
                "scheme": "https",
                "tlsConfig": { "insecureSkipVerify": true },
                "honorLabels": true,
            }],
        }),
    );
    sm.metadata = object_meta(SERVICE_MONITOR_NAME, Some(monitor_namespace), APP_COMPONENT);
    if let Some(labels) = sm.metadata.labels.as_mut() {
        labels.insert("openshift.io/cluster-monitoring".to_string(), "".to_string());
        labels.insert(PROMETHEUS_LABEL.to_string(), "true".to_string());
    }
    sm
}

pub fn prometheus_rule(namespace: &str) -> PrometheusRule {
    let alert = |name: &str, component: &str| {
        json!({
            "alert": name,
            "expr": format!("sum(up{{namespace='{namespace}', pod=~'{component}-.*'}}) == 0"),
            "for": "10m",
            "labels": { "severity": "critical", "operator_health_impact": "critical" },
            "annotations": { "summary": format!("{component} is down") },
        })
    };
    let mut rule = PrometheusRule::new(PROMETHEUS_RULE_NAME).with_field(
        "spec",
        json!({
            "groups": [{
                "name": "kubevirt.rules",
                "rules": [
                    alert("VirtAPIDown", VIRT_API),
                    alert("VirtControllerDown", VIRT_CONTROLLER),
                    alert("VirtHandlerDown", VIRT_HANDLER),
                ],
            }],
        }),
    );
    rule.metadata = object_meta(PROMETHEUS_RULE_NAME, Some(namespace), APP_COMPONENT);
    if let Some(labels) = rule.metadata.labels.as_mut() {
        labels.insert("prometheus".to_string(), "k8s".to_string());
        labels.insert("role".to_string(), "alert-rules".to_string());
    }
    rule
}

fn scc(name: &str, component: &str, namespace: &str, service_account: &str, privileged: bool) -> SecurityContextConstraints {
    let mut scc = SecurityContextConstraints::new(name)
        .with_field("allowPrivilegedContainer", json!(privileged))
        .with_field("allowHostPID", json!(privileged))
        .with_field("allowHostDirVolumePlugin", json!(privileged))
        .with_field("runAsUser", json!({ "type": if privileged { "RunAsAny" } else { "MustRunAsNonRoot" } }))
        .with_field("seLinuxContext", json!({ "type": "RunAsAny" }))
        .with_field("volumes", json!(["*"]))
        .with_field(
            "users",
            json!([format!("system:serviceaccount:{namespace}:{service_account}")]),
        );
    scc.metadata = object_meta(name, None, component);
    scc
}

pub fn all_sccs(namespace: &str) -> Vec<SecurityContextConstraints> {
    vec![
        scc("kubevirt-handler", VIRT_HANDLER, namespace, HANDLER_SERVICE_ACCOUNT, true),
        scc("kubevirt-controller", VIRT_CONTROLLER, namespace, CONTROLLER_SERVICE_ACCOUNT, false),
    ]
}
