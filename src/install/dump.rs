//! Serialization of strategies into install strategy config maps and back.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::*;

use super::{Strategy, generate_current_install_strategy};
use crate::client::ClusterClient;
use crate::config::{DeploymentConfig, Env};
use crate::kinds::{
    INSTALL_STRATEGY_ENCODING_ANNOTATION, INSTALL_STRATEGY_ID_ANNOTATION, INSTALL_STRATEGY_LABEL,
    INSTALL_STRATEGY_REGISTRY_ANNOTATION, INSTALL_STRATEGY_VERSION_ANNOTATION, Kind, MANAGED_BY_LABEL,
    MANAGED_BY_OPERATOR, ManagedObject, ObjectKey,
};
use crate::{Error, Result};

pub static MANIFESTS_KEY: &str = "manifests";
pub static GZIP_BASE64_ENCODING: &str = "gzip+base64";
pub static CONFIG_MAP_GENERATE_NAME: &str = "kubevirt-install-strategy-";

/// Multi-document YAML of every object, in the fixed strategy order
pub fn dump_install_strategy_to_bytes(strategy: &Strategy) -> Result<Vec<u8>> {
    let mut out = String::new();
    for object in strategy.objects() {
        let mut value = object.to_value()?;
        if object.kind() == Kind::ConfigMap {
            strip_label(&mut value, MANAGED_BY_LABEL);
        }
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&value)?);
    }
    Ok(out.into_bytes())
}

fn strip_label(value: &mut Value, label: &str) {
    if let Some(labels) = value.pointer_mut("/metadata/labels").and_then(Value::as_object_mut) {
        labels.remove(label);
    }
}

pub fn load_install_strategy_from_bytes(data: &str) -> Result<Strategy> {
    let mut strategy = Strategy::default();
    for document in data.split("\n---") {
        let document = document.trim().trim_start_matches("---").trim();
        if document.is_empty() {
            continue;
        }
        let value: Value = serde_yaml::from_str(document)?;
        let api_kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        let kind = Kind::from_api_kind(api_kind).ok_or_else(|| Error::UnknownKind(api_kind.to_string()))?;
        strategy.push(ManagedObject::from_value(kind, value)?)?;
    }
    Ok(strategy)
}

pub fn encode_manifests(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(Error::IoError)?;
    let compressed = encoder.finish().map_err(Error::IoError)?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_manifests(data: &str) -> Result<String> {
    let compressed = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::InvalidConfig(format!("install strategy is not valid base64: {e}")))?;
    let mut out = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut out)
        .map_err(Error::IoError)?;
    Ok(out)
}

/// Config map carrying `strategy` for `config`, compressed
pub fn new_install_strategy_config_map(config: &DeploymentConfig, strategy: &Strategy) -> Result<ConfigMap> {
    let manifests = encode_manifests(&dump_install_strategy_to_bytes(strategy)?)?;
    Ok(ConfigMap {
        metadata: ObjectMeta {
            generate_name: Some(CONFIG_MAP_GENERATE_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_OPERATOR.to_string()),
                (INSTALL_STRATEGY_LABEL.to_string(), String::new()),
            ])),
            annotations: Some(BTreeMap::from([
                (INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), config.kube_virt_version.clone()),
                (INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(), config.registry.clone()),
                (INSTALL_STRATEGY_ID_ANNOTATION.to_string(), config.deployment_id().to_string()),
                (INSTALL_STRATEGY_ENCODING_ANNOTATION.to_string(), GZIP_BASE64_ENCODING.to_string()),
            ])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(MANIFESTS_KEY.to_string(), manifests)])),
        ..Default::default()
    })
}

fn manifests(config_map: &ConfigMap) -> Result<String> {
    let name = config_map.metadata.name.as_deref().unwrap_or_default();
    let data = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(MANIFESTS_KEY))
        .ok_or_else(|| Error::OtherError(format!("install strategy configmap {name} does not contain 'manifests' key")))?;
    let encoding = config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INSTALL_STRATEGY_ENCODING_ANNOTATION));
    match encoding.map(String::as_str) {
        None | Some("") => Ok(data.clone()),
        Some(e) if e == GZIP_BASE64_ENCODING => decode_manifests(data),
        Some(other) => Err(Error::InvalidConfig(format!("unknown install strategy encoding {other}"))),
    }
}

fn created(cm: &ConfigMap) -> Option<chrono::DateTime<chrono::Utc>> {
    cm.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Latest creation timestamp wins, ties keep the first seen
pub fn most_recent_config_map<'a>(config_maps: &[&'a ConfigMap]) -> Option<&'a ConfigMap> {
    let mut best: Option<&ConfigMap> = None;
    for cm in config_maps {
        let newer = match best {
            None => true,
            Some(b) => created(cm) > created(b),
        };
        if newer {
            best = Some(cm);
        }
    }
    best
}

/// Loads the strategy stored for `config` from the cached install strategy config maps
pub fn load_install_strategy_from_cache(config_maps: &[ConfigMap], config: &DeploymentConfig) -> Result<Strategy> {
    let matching: Vec<&ConfigMap> = config_maps
        .iter()
        .filter(|cm| cm.metadata.namespace.as_deref() == Some(config.namespace.as_str()))
        .filter(|cm| {
            let Some(annotations) = cm.metadata.annotations.as_ref() else {
                return false;
            };
            let get = |key: &str| annotations.get(key).map(String::as_str).unwrap_or_default();
            config.matches(
                get(INSTALL_STRATEGY_VERSION_ANNOTATION),
                get(INSTALL_STRATEGY_REGISTRY_ANNOTATION),
                get(INSTALL_STRATEGY_ID_ANNOTATION),
            )
        })
        .collect();

    let config_map = most_recent_config_map(&matching).ok_or_else(|| Error::StrategyNotFound {
        version: config.kube_virt_version.clone(),
        registry: config.registry.clone(),
    })?;
    load_install_strategy_from_bytes(&manifests(config_map)?)
}

async fn namespace_exists(client: &dyn ClusterClient, namespace: &str) -> Result<bool> {
    Ok(client.get(&ObjectKey::new(Kind::Namespace, None, namespace)).await?.is_some())
}

/// Namespace the monitoring objects go to, when both the namespace and the
/// monitoring service account exist
async fn probe_monitor_namespace(client: &dyn ClusterClient, config: &DeploymentConfig) -> Result<Option<String>> {
    let namespace = config.monitor_namespace();
    if !namespace_exists(client, namespace).await? {
        return Ok(None);
    }
    let account = config.monitor_service_account();
    let key = ObjectKey::new(Kind::ServiceAccount, Some(namespace), account);
    match client.get(&key).await? {
        Some(_) => Ok(Some(namespace.to_string())),
        None => {
            warn!("monitoring service account {namespace}/{account} not found");
            Ok(None)
        }
    }
}

/// Dump mode: generates the strategy described by the environment and stores it
pub async fn dump_install_strategy_to_config_map(
    client: &dyn ClusterClient,
    env: &Env,
    operator_namespace: &str,
) -> Result<()> {
    let config = DeploymentConfig::from_env(env)?;
    let monitor_namespace = probe_monitor_namespace(client, &config).await?;
    let service_monitor_namespace = match monitor_namespace {
        Some(_) => {
            let ns = config.service_monitor_namespace();
            namespace_exists(client, ns).await?.then(|| ns.to_string())
        }
        None => None,
    };

    let strategy = generate_current_install_strategy(
        &config,
        monitor_namespace.as_deref(),
        service_monitor_namespace.as_deref(),
        operator_namespace,
    )?;
    let config_map = new_install_strategy_config_map(&config, &strategy)?;

    match client.create(&ManagedObject::InstallStrategyConfigMap(config_map.clone())).await {
        Ok(created) => info!("install strategy stored in configmap {}", created.name()),
        Err(e) if e.is_already_exists() => {
            client.replace_config_map(&config_map).await?;
            info!("install strategy configmap replaced");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ErrorResponse;

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            id: "abc".into(),
            namespace: "kubevirt".into(),
            registry: "quay.io/kubevirt".into(),
            kube_virt_version: "v1.2.0".into(),
            ..Default::default()
        }
    }

    fn strategy() -> Strategy {
        generate_current_install_strategy(&config(), Some("monitoring"), None, "kubevirt").unwrap()
    }

    #[test]
    fn dump_strips_managed_by_from_config_maps_only() {
        let bytes = dump_install_strategy_to_bytes(&strategy()).unwrap();
        let loaded = load_install_strategy_from_bytes(std::str::from_utf8(&bytes).unwrap()).unwrap();
        for cm in loaded.config_maps() {
            assert!(!cm.metadata.labels.as_ref().unwrap().contains_key(MANAGED_BY_LABEL));
        }
        assert_eq!(loaded.deployments(), strategy().deployments());
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let doc = "---\napiVersion: v1\nkind: Gadget\nmetadata:\n  name: x\n";
        assert!(matches!(load_install_strategy_from_bytes(doc), Err(Error::UnknownKind(k)) if k == "Gadget"));
    }

    #[test]
    fn encoding_is_reversible() {
        let encoded = encode_manifests(b"kind: ServiceAccount").unwrap();
        assert_eq!(decode_manifests(&encoded).unwrap(), "kind: ServiceAccount");
    }

    fn stored(name: &str, id: &str, version: &str, secs: i64) -> ConfigMap {
        let mut cm = new_install_strategy_config_map(&config(), &strategy()).unwrap();
        cm.metadata.name = Some(name.into());
        cm.metadata.creation_timestamp = Some(Time(chrono::DateTime::from_timestamp(secs, 0).unwrap()));
        let annotations = cm.metadata.annotations.as_mut().unwrap();
        annotations.insert(INSTALL_STRATEGY_ID_ANNOTATION.into(), id.into());
        annotations.insert(INSTALL_STRATEGY_VERSION_ANNOTATION.into(), version.into());
        cm
    }

    #[test]
    fn legacy_entries_match_on_version_and_registry() {
        let cms = vec![stored("legacy", "", "v1.2.0", 10)];
        assert!(load_install_strategy_from_cache(&cms, &config()).is_ok());
        let cms = vec![stored("legacy", "", "v1.1.0", 10)];
        assert!(matches!(
            load_install_strategy_from_cache(&cms, &config()),
            Err(Error::StrategyNotFound { .. })
        ));
    }

    #[test]
    fn most_recent_wins() {
        let old = stored("old", "abc", "v1.2.0", 10);
        let new = stored("new", "abc", "v1.2.0", 20);
        assert_eq!(
            most_recent_config_map(&[&old, &new]).unwrap().metadata.name.as_deref(),
            Some("new")
        );
        assert_eq!(
            most_recent_config_map(&[&new, &old]).unwrap().metadata.name.as_deref(),
            Some("new")
        );
    }

    #[test]
    fn missing_manifests_is_an_error() {
        let mut cm = stored("empty", "abc", "v1.2.0", 10);
        cm.data = None;
        assert!(load_install_strategy_from_cache(&[cm], &config()).is_err());
    }

    fn api_error(reason: &str, code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        }))
    }

    #[tokio::test]
    async fn dump_replaces_existing_config_map() {
        let env: Env = [
            ("OPERATOR_IMAGE", "quay.io/kubevirt/virt-operator:v1.2.0"),
            ("TARGET_INSTALL_NAMESPACE", "kubevirt"),
        ]
        .into_iter()
        .collect();
        let mut client = MockClusterClient::new();
        client
            .expect_get()
            .withf(|key| key.kind == Kind::Namespace)
            .returning(|key| {
                let ns = Namespace {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                Ok(Some(ManagedObject::Namespace(ns)))
            });
        client
            .expect_get()
            .withf(|key| key.kind == Kind::ServiceAccount)
            .returning(|_| Ok(None));
        client
            .expect_create()
            .times(1)
            .returning(|_| Err(api_error("AlreadyExists", 409)));
        client
            .expect_replace_config_map()
            .times(1)
            .withf(|cm| cm.metadata.namespace.as_deref() == Some("kubevirt"))
            .returning(|cm| Ok(cm.clone()));

        dump_install_strategy_to_config_map(&client, &env, "kubevirt").await.unwrap();
    }
}
