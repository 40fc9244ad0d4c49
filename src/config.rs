//! Deployment configuration: what to install, derived from the operator's environment and
//! the KubeVirt CR.
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::crd::KubeVirt;
use crate::{Error, Result};

pub static OPERATOR_IMAGE_ENV: &str = "OPERATOR_IMAGE";
pub static VIRT_API_SHASUM_ENV: &str = "VIRT_API_SHASUM";
pub static VIRT_CONTROLLER_SHASUM_ENV: &str = "VIRT_CONTROLLER_SHASUM";
pub static VIRT_HANDLER_SHASUM_ENV: &str = "VIRT_HANDLER_SHASUM";
pub static VIRT_LAUNCHER_SHASUM_ENV: &str = "VIRT_LAUNCHER_SHASUM";
pub static VIRT_EXPORTPROXY_SHASUM_ENV: &str = "VIRT_EXPORTPROXY_SHASUM";
pub static VIRT_EXPORTSERVER_SHASUM_ENV: &str = "VIRT_EXPORTSERVER_SHASUM";
pub static KUBEVIRT_VERSION_ENV: &str = "KUBEVIRT_VERSION";
pub static TARGET_INSTALL_NAMESPACE_ENV: &str = "TARGET_INSTALL_NAMESPACE";
pub static TARGET_IMAGE_PULL_POLICY_ENV: &str = "TARGET_IMAGE_PULL_POLICY";
pub static TARGET_DEPLOYMENT_CONFIG_ENV: &str = "TARGET_DEPLOYMENT_CONFIG";
pub static PASSTHROUGH_ENV_PREFIX: &str = "KV_IO_EXTRA_ENV_";

pub static PROP_IMAGE_PULL_POLICY: &str = "ImagePullPolicy";
pub static PROP_IMAGE_PULL_SECRETS: &str = "ImagePullSecrets";
pub static PROP_MONITOR_NAMESPACE: &str = "MonitorNamespace";
pub static PROP_SERVICE_MONITOR_NAMESPACE: &str = "ServiceMonitorNamespace";
pub static PROP_MONITOR_ACCOUNT: &str = "MonitorAccount";
pub static PROP_PRODUCT_NAME: &str = "ProductName";
pub static PROP_PRODUCT_VERSION: &str = "ProductVersion";
pub static PROP_PRODUCT_COMPONENT: &str = "ProductComponent";
pub static PROP_UNINSTALL_STRATEGY: &str = "UninstallStrategy";
pub static PROP_IMAGE_PREFIX: &str = "imagePrefix";

pub static DEFAULT_MONITOR_NAMESPACE: &str = "openshift-monitoring";
pub static DEFAULT_MONITOR_ACCOUNT: &str = "prometheus-k8s";
pub static DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
pub static DEFAULT_VERBOSITY: &str = "2";

/// Components whose image can be overridden with `VIRT_<NAME>_IMAGE`
const IMAGE_OVERRIDES: &[(&str, &str)] = &[
    ("VIRT_OPERATOR_IMAGE", "VirtOperatorImage"),
    ("VIRT_API_IMAGE", "VirtApiImage"),
    ("VIRT_CONTROLLER_IMAGE", "VirtControllerImage"),
    ("VIRT_HANDLER_IMAGE", "VirtHandlerImage"),
    ("VIRT_LAUNCHER_IMAGE", "VirtLauncherImage"),
    ("VIRT_EXPORTPROXY_IMAGE", "VirtExportProxyImage"),
    ("VIRT_EXPORTSERVER_IMAGE", "VirtExportServerImage"),
];

static OPERATOR_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)/(.*)virt-operator([@:].*)?$").expect("static regex")
});

/// Snapshot of the process environment the configuration is derived from
#[derive(Clone, Debug, Default)]
pub struct Env(BTreeMap<String, String>);

impl Env {
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    /// Value of `name`, empty values count as unset
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// `KV_IO_EXTRA_ENV_*` variables with the prefix stripped
    pub fn passthrough(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(PASSTHROUGH_ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }

    /// Ensures the operator image parses and that shasums are given for all or none of
    /// the components
    pub fn verify(&self) -> Result<()> {
        let image = self
            .get(OPERATOR_IMAGE_ENV)
            .ok_or_else(|| Error::InvalidConfig(format!("empty env var {OPERATOR_IMAGE_ENV}")))?;
        if parse_operator_image(image).is_none() {
            return Err(Error::InvalidConfig(format!("can not parse operator image {image}")));
        }
        let required = [
            VIRT_API_SHASUM_ENV,
            VIRT_CONTROLLER_SHASUM_ENV,
            VIRT_HANDLER_SHASUM_ENV,
            VIRT_LAUNCHER_SHASUM_ENV,
            KUBEVIRT_VERSION_ENV,
        ];
        let missing: Vec<&str> = required.iter().copied().filter(|n| self.get(n).is_none()).collect();
        if !missing.is_empty() && missing.len() < required.len() {
            return Err(Error::InvalidConfig(format!(
                "incomplete configuration, missing env vars {missing:?}"
            )));
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Env {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Env(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Registry, image prefix and tag-or-digest of an operator image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorImage {
    pub registry: String,
    pub prefix: String,
    /// `:tag`, `@digest`, or empty
    pub version: String,
}

pub fn parse_operator_image(image: &str) -> Option<OperatorImage> {
    let caps = OPERATOR_IMAGE.captures(image)?;
    let group = |i| caps.get(i).map_or("", |m| m.as_str()).to_string();
    Some(OperatorImage {
        registry: group(1),
        prefix: group(2),
        version: group(3),
    })
}

fn is_empty(s: &str) -> bool {
    s.is_empty()
}

/// Everything that decides which objects make up an installation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentConfig {
    #[serde(skip_serializing_if = "is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub registry: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub image_prefix: String,
    /// Image tag, also used for the up- or downgrade decision when shasums are in use
    #[serde(skip_serializing_if = "is_empty")]
    pub kube_virt_version: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_operator_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_api_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_controller_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_handler_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_launcher_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_export_proxy_sha: String,
    #[serde(skip_serializing_if = "is_empty")]
    pub virt_export_server_sha: String,
    /// Remaining inputs, mostly taken from the CR spec
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_properties: BTreeMap<String, String>,
    /// Environment passed on to the components
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub passthrough_env_vars: BTreeMap<String, String>,
}

impl DeploymentConfig {
    /// Configuration for dump mode: `TARGET_DEPLOYMENT_CONFIG` if present, otherwise
    /// built from the legacy namespace and pull policy variables.
    pub fn from_env(env: &Env) -> Result<Self> {
        if let Some(raw) = env.get(TARGET_DEPLOYMENT_CONFIG_ENV) {
            return Ok(serde_json::from_str(raw)?);
        }
        let namespace = match env.get(TARGET_INSTALL_NAMESPACE_ENV) {
            Some(ns) => ns.to_string(),
            None => crate::helper::get_my_namespace()?,
        };
        let mut props = BTreeMap::new();
        if let Some(policy) = env.get(TARGET_IMAGE_PULL_POLICY_ENV) {
            props.insert(PROP_IMAGE_PULL_POLICY.to_string(), policy.to_string());
        }
        Ok(Self::build("", "", &namespace, props, env))
    }

    /// Target configuration requested by the CR. Spec overrides of registry or tag take
    /// precedence over the operator's own image.
    pub fn target_from_kv(kv: &KubeVirt, env: &Env) -> Self {
        let registry = kv.spec.image_registry.as_deref().unwrap_or_default();
        let tag = kv.spec.image_tag.as_deref().unwrap_or_default();
        let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
        Self::build(registry, tag, namespace, properties_from_kv(kv), env)
    }

    /// Configuration recorded as observed in the CR status
    pub fn observed_from_kv(kv: &KubeVirt, env: &Env) -> Result<Self> {
        let status = kv.status_ref();
        let mut props = properties_from_kv(kv);
        let stored: serde_json::Value =
            serde_json::from_str(status.observed_deployment_config.as_deref().unwrap_or("{}"))?;
        let prefix = stored
            .get(PROP_IMAGE_PREFIX)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        props.insert(PROP_IMAGE_PREFIX.to_string(), prefix.to_string());
        Ok(Self::build(
            status.observed_kube_virt_registry.as_deref().unwrap_or_default(),
            status.observed_kube_virt_version.as_deref().unwrap_or_default(),
            kv.metadata.namespace.as_deref().unwrap_or_default(),
            props,
            env,
        ))
    }

    fn build(registry: &str, tag: &str, namespace: &str, mut props: BTreeMap<String, String>, env: &Env) -> Self {
        let mut registry = registry.to_string();
        let mut tag = tag.to_string();
        let stored_prefix = props.get(PROP_IMAGE_PREFIX).cloned();
        let mut prefix = stored_prefix.clone().unwrap_or_default();
        let mut operator_sha = String::new();
        let mut skip_shasums = false;

        for (var, prop) in IMAGE_OVERRIDES {
            if let Some(image) = env.get(var) {
                props.insert(prop.to_string(), image.to_string());
            }
        }

        if let Some(image) = env.get(OPERATOR_IMAGE_ENV).and_then(parse_operator_image) {
            if registry.is_empty() {
                registry = image.registry;
            }
            if stored_prefix.is_none() {
                prefix = image.prefix;
            }
            let from_operator = match image.version.as_str() {
                "" => "latest".to_string(),
                v if v.starts_with(':') => v[1..].to_string(),
                v => {
                    // a digest; the other shasums are expected in the environment
                    operator_sha = v.trim_start_matches('@').to_string();
                    "latest".to_string()
                }
            };
            if tag.is_empty() {
                tag = from_operator;
            } else {
                skip_shasums = true;
            }
        }

        let mut config = Self {
            namespace: namespace.to_string(),
            registry,
            image_prefix: prefix,
            kube_virt_version: tag,
            additional_properties: props,
            passthrough_env_vars: env.passthrough(),
            ..Default::default()
        };

        if !skip_shasums {
            let shas = (
                env.get(VIRT_API_SHASUM_ENV),
                env.get(VIRT_CONTROLLER_SHASUM_ENV),
                env.get(VIRT_HANDLER_SHASUM_ENV),
                env.get(VIRT_LAUNCHER_SHASUM_ENV),
                env.get(KUBEVIRT_VERSION_ENV),
            );
            if let (Some(api), Some(controller), Some(handler), Some(launcher), Some(version)) = shas {
                if !operator_sha.is_empty() {
                    config.kube_virt_version = version.to_string();
                    config.virt_operator_sha = operator_sha;
                    config.virt_api_sha = api.to_string();
                    config.virt_controller_sha = controller.to_string();
                    config.virt_handler_sha = handler.to_string();
                    config.virt_launcher_sha = launcher.to_string();
                    config.virt_export_proxy_sha = env.get(VIRT_EXPORTPROXY_SHASUM_ENV).unwrap_or_default().to_string();
                    config.virt_export_server_sha = env.get(VIRT_EXPORTSERVER_SHASUM_ENV).unwrap_or_default().to_string();
                }
            }
        }

        config.id = config.compute_id();
        config
    }

    /// Hex sha1 over every field name and value, map entries in key order. An empty
    /// image prefix hashes like a missing one.
    fn compute_id(&self) -> String {
        let mut hasher = Sha1::new();
        let scalars = [
            ("Namespace", &self.namespace),
            ("Registry", &self.registry),
            ("ImagePrefix", &self.image_prefix),
            ("KubeVirtVersion", &self.kube_virt_version),
            ("VirtOperatorSha", &self.virt_operator_sha),
            ("VirtApiSha", &self.virt_api_sha),
            ("VirtControllerSha", &self.virt_controller_sha),
            ("VirtHandlerSha", &self.virt_handler_sha),
            ("VirtLauncherSha", &self.virt_launcher_sha),
            ("VirtExportProxySha", &self.virt_export_proxy_sha),
            ("VirtExportServerSha", &self.virt_export_server_sha),
        ];
        for (name, value) in scalars {
            hasher.update(name.as_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.update(b"AdditionalProperties");
        for (k, v) in &self.additional_properties {
            if k.is_empty() || (k == PROP_IMAGE_PREFIX && v.is_empty()) {
                continue;
            }
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(b"PassthroughEnvVars");
        for (k, v) in &self.passthrough_env_vars {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn deployment_id(&self) -> &str {
        &self.id
    }

    pub fn json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn use_shasums(&self) -> bool {
        [
            &self.virt_operator_sha,
            &self.virt_api_sha,
            &self.virt_controller_sha,
            &self.virt_handler_sha,
            &self.virt_launcher_sha,
        ]
        .iter()
        .all(|s| !s.is_empty())
    }

    fn version_or_sha<'a>(&'a self, sha: &'a str) -> &'a str {
        if self.use_shasums() && !sha.is_empty() {
            sha
        } else {
            &self.kube_virt_version
        }
    }

    pub fn operator_version(&self) -> &str {
        self.version_or_sha(&self.virt_operator_sha)
    }

    pub fn api_version(&self) -> &str {
        self.version_or_sha(&self.virt_api_sha)
    }

    pub fn controller_version(&self) -> &str {
        self.version_or_sha(&self.virt_controller_sha)
    }

    pub fn handler_version(&self) -> &str {
        self.version_or_sha(&self.virt_handler_sha)
    }

    pub fn launcher_version(&self) -> &str {
        self.version_or_sha(&self.virt_launcher_sha)
    }

    pub fn export_proxy_version(&self) -> &str {
        self.version_or_sha(&self.virt_export_proxy_sha)
    }

    pub fn export_server_version(&self) -> &str {
        self.version_or_sha(&self.virt_export_server_sha)
    }

    /// Image reference for `component`, honouring `VIRT_*_IMAGE` overrides
    pub fn image(&self, component: &str, version: &str) -> String {
        let override_key = match component {
            "virt-operator" => "VirtOperatorImage",
            "virt-api" => "VirtApiImage",
            "virt-controller" => "VirtControllerImage",
            "virt-handler" => "VirtHandlerImage",
            "virt-launcher" => "VirtLauncherImage",
            "virt-exportproxy" => "VirtExportProxyImage",
            "virt-exportserver" => "VirtExportServerImage",
            _ => "",
        };
        if let Some(image) = self.additional_properties.get(override_key).filter(|i| !i.is_empty()) {
            return image.clone();
        }
        let sep = if self.use_shasums() { "@" } else { ":" };
        format!("{}/{}{}{}{}", self.registry, self.image_prefix, component, sep, version)
    }

    fn prop_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.additional_properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }

    pub fn image_pull_policy(&self) -> &str {
        self.prop_or(PROP_IMAGE_PULL_POLICY, DEFAULT_IMAGE_PULL_POLICY)
    }

    pub fn monitor_namespace(&self) -> &str {
        self.prop_or(PROP_MONITOR_NAMESPACE, DEFAULT_MONITOR_NAMESPACE)
    }

    /// Namespace for the service monitor, defaults to the monitor namespace
    pub fn service_monitor_namespace(&self) -> &str {
        self.prop_or(PROP_SERVICE_MONITOR_NAMESPACE, self.monitor_namespace())
    }

    pub fn monitor_service_account(&self) -> &str {
        self.prop_or(PROP_MONITOR_ACCOUNT, DEFAULT_MONITOR_ACCOUNT)
    }

    pub fn product_name(&self) -> &str {
        self.prop_or(PROP_PRODUCT_NAME, "")
    }

    pub fn product_version(&self) -> &str {
        self.prop_or(PROP_PRODUCT_VERSION, "")
    }

    pub fn product_component(&self) -> &str {
        self.prop_or(PROP_PRODUCT_COMPONENT, "")
    }

    pub fn verbosity(&self) -> &str {
        DEFAULT_VERBOSITY
    }

    pub fn image_pull_secrets(&self) -> Vec<k8s_openapi::api::core::v1::LocalObjectReference> {
        self.additional_properties
            .get(PROP_IMAGE_PULL_SECRETS)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Whether the configuration is the one an install strategy was stored for. Entries
    /// without an id fall back to version and registry.
    pub fn matches(&self, version: &str, registry: &str, id: &str) -> bool {
        if id.is_empty() {
            version == self.kube_virt_version && registry == self.registry
        } else {
            id == self.id
        }
    }

    pub fn set_target(&self, kv: &mut KubeVirt) -> Result<()> {
        let json = self.json()?;
        let status = kv.status_mut();
        status.target_kube_virt_version = Some(self.kube_virt_version.clone());
        status.target_kube_virt_registry = Some(self.registry.clone());
        status.target_deployment_id = Some(self.id.clone());
        status.target_deployment_config = Some(json);
        Ok(())
    }

    pub fn set_observed(&self, kv: &mut KubeVirt) -> Result<()> {
        let json = self.json()?;
        let status = kv.status_mut();
        status.observed_kube_virt_version = Some(self.kube_virt_version.clone());
        status.observed_kube_virt_registry = Some(self.registry.clone());
        status.observed_deployment_id = Some(self.id.clone());
        status.observed_deployment_config = Some(json);
        Ok(())
    }

    /// Passthrough env as container env vars
    pub fn extra_env(&self) -> Vec<k8s_openapi::api::core::v1::EnvVar> {
        self.passthrough_env_vars
            .iter()
            .map(|(name, value)| k8s_openapi::api::core::v1::EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect()
    }
}

/// Spec fields that shape the generated objects, registry and tag excluded
fn properties_from_kv(kv: &KubeVirt) -> BTreeMap<String, String> {
    let spec = &kv.spec;
    let mut props = BTreeMap::new();
    let mut put = |key: &str, value: Option<&String>| {
        if let Some(v) = value {
            props.insert(key.to_string(), v.clone());
        }
    };
    put(PROP_IMAGE_PULL_POLICY, spec.image_pull_policy.as_ref());
    put(PROP_MONITOR_NAMESPACE, spec.monitor_namespace.as_ref());
    put(PROP_SERVICE_MONITOR_NAMESPACE, spec.service_monitor_namespace.as_ref());
    put(PROP_MONITOR_ACCOUNT, spec.monitor_account.as_ref());
    put(PROP_PRODUCT_NAME, spec.product_name.as_ref());
    put(PROP_PRODUCT_VERSION, spec.product_version.as_ref());
    put(PROP_PRODUCT_COMPONENT, spec.product_component.as_ref());
    put(PROP_UNINSTALL_STRATEGY, spec.uninstall_strategy.as_ref());
    if let Some(secrets) = spec.image_pull_secrets.as_ref().filter(|s| !s.is_empty()) {
        if let Ok(raw) = serde_json::to_string(secrets) {
            props.insert(PROP_IMAGE_PULL_SECRETS.to_string(), raw);
        }
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeVirtSpec;

    fn env(extra: &[(&str, &str)]) -> Env {
        let mut vars = vec![(OPERATOR_IMAGE_ENV, "quay.io/kubevirt/virt-operator:v1.2.0")];
        vars.extend_from_slice(extra);
        vars.into_iter().collect()
    }

    fn kv(spec: KubeVirtSpec) -> KubeVirt {
        let mut kv = KubeVirt::new("kubevirt", spec);
        kv.metadata.namespace = Some("kubevirt".into());
        kv
    }

    #[test]
    fn operator_image_is_split() {
        let img = parse_operator_image("quay.io/kubevirt/pre-virt-operator@sha256:abc").unwrap();
        assert_eq!(img.registry, "quay.io/kubevirt");
        assert_eq!(img.prefix, "pre-");
        assert_eq!(img.version, "@sha256:abc");
        assert!(parse_operator_image("virt-operator").is_none());
    }

    #[test]
    fn tag_comes_from_operator_image_unless_overridden() {
        let config = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[]));
        assert_eq!(config.registry, "quay.io/kubevirt");
        assert_eq!(config.kube_virt_version, "v1.2.0");
        assert_eq!(config.image("virt-api", config.api_version()), "quay.io/kubevirt/virt-api:v1.2.0");

        let spec = KubeVirtSpec {
            image_tag: Some("v1.3.0".into()),
            image_registry: Some("registry.local".into()),
            ..Default::default()
        };
        let config = DeploymentConfig::target_from_kv(&kv(spec), &env(&[]));
        assert_eq!(config.image("virt-handler", config.handler_version()), "registry.local/virt-handler:v1.3.0");
    }

    #[test]
    fn shasums_are_used_for_digest_operator_images() {
        let e: Env = [
            (OPERATOR_IMAGE_ENV, "quay.io/kubevirt/virt-operator@sha256:op"),
            (VIRT_API_SHASUM_ENV, "sha256:api"),
            (VIRT_CONTROLLER_SHASUM_ENV, "sha256:ctrl"),
            (VIRT_HANDLER_SHASUM_ENV, "sha256:handler"),
            (VIRT_LAUNCHER_SHASUM_ENV, "sha256:launcher"),
            (KUBEVIRT_VERSION_ENV, "v1.2.0"),
        ]
        .into_iter()
        .collect();
        e.verify().unwrap();
        let config = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &e);
        assert!(config.use_shasums());
        assert_eq!(config.kube_virt_version, "v1.2.0");
        assert_eq!(config.image("virt-api", config.api_version()), "quay.io/kubevirt/virt-api@sha256:api");
    }

    #[test]
    fn partial_shasums_fail_verification() {
        let e = env(&[(VIRT_API_SHASUM_ENV, "sha256:api")]);
        assert!(matches!(e.verify(), Err(Error::InvalidConfig(_))));
        assert!(Env::default().verify().is_err());
    }

    #[test]
    fn id_tracks_inputs() {
        let a = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[]));
        let b = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[]));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 40);

        let spec = KubeVirtSpec {
            image_pull_policy: Some("Always".into()),
            ..Default::default()
        };
        let c = DeploymentConfig::target_from_kv(&kv(spec), &env(&[]));
        assert_ne!(a.id, c.id);
        assert_eq!(c.image_pull_policy(), "Always");

        let d = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[("KV_IO_EXTRA_ENV_FOO", "bar")]));
        assert_ne!(a.id, d.id);
        assert_eq!(d.passthrough_env_vars.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn json_round_trips_and_sets_status() {
        let config = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[]));
        let parsed: DeploymentConfig = serde_json::from_str(&config.json().unwrap()).unwrap();
        assert_eq!(parsed, config);

        let mut kv = kv(KubeVirtSpec::default());
        config.set_target(&mut kv).unwrap();
        config.set_observed(&mut kv).unwrap();
        let observed = DeploymentConfig::observed_from_kv(&kv, &env(&[])).unwrap();
        assert_eq!(observed.id, config.id);
    }

    #[test]
    fn legacy_entries_match_on_version_and_registry() {
        let config = DeploymentConfig::target_from_kv(&kv(KubeVirtSpec::default()), &env(&[]));
        assert!(config.matches("v1.2.0", "quay.io/kubevirt", ""));
        assert!(!config.matches("v1.2.0", "quay.io/kubevirt", "other"));
        assert!(config.matches("x", "y", &config.id));
    }

    #[test]
    fn monitoring_defaults() {
        let config = DeploymentConfig::default();
        assert_eq!(config.monitor_namespace(), DEFAULT_MONITOR_NAMESPACE);
        assert_eq!(config.service_monitor_namespace(), DEFAULT_MONITOR_NAMESPACE);
        assert_eq!(config.monitor_service_account(), DEFAULT_MONITOR_ACCOUNT);
        assert_eq!(config.image_pull_policy(), DEFAULT_IMAGE_PULL_POLICY);
    }
}
