//! Operator metadata stamped on every applied object and the generation ledger kept in
//! `status.generations`.
use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation, TestOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::crd::{GenerationStatus, KubeVirt};
use crate::helper::is_valid_label;
use crate::kinds::{
    APP_COMPONENT, APP_COMPONENT_LABEL, APP_PART_OF_LABEL, APP_VERSION_LABEL, GENERATION_ANNOTATION,
    INSTALL_STRATEGY_ID_ANNOTATION, INSTALL_STRATEGY_REGISTRY_ANNOTATION, INSTALL_STRATEGY_VERSION_ANNOTATION,
    MANAGED_BY_LABEL, MANAGED_BY_OPERATOR, ManagedObject, is_managed_by_operator,
};

/// Version, registry and deployment id the CR is converging to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetVersion {
    pub version: String,
    pub registry: String,
    pub id: String,
}

impl TargetVersion {
    pub fn of(kv: &KubeVirt) -> Self {
        let status = kv.status_ref();
        Self {
            version: status.target_kube_virt_version.unwrap_or_default(),
            registry: status.target_kube_virt_registry.unwrap_or_default(),
            id: status.target_deployment_id.unwrap_or_default(),
        }
    }
}

fn non_empty_label(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty() && is_valid_label(v))
}

/// Stamps the operator labels and the install strategy annotations on `meta`.
///
/// With `with_generation` the CR generation is recorded as well, so a spec change of the
/// CR invalidates objects that were already at the target version.
pub fn inject_operator_metadata(kv: &KubeVirt, meta: &mut ObjectMeta, target: &TargetVersion, with_generation: bool) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    if let Some(version) = non_empty_label(&kv.spec.product_version) {
        labels.insert(APP_VERSION_LABEL.to_string(), version.to_string());
    }
    if let Some(name) = non_empty_label(&kv.spec.product_name) {
        labels.insert(APP_PART_OF_LABEL.to_string(), name.to_string());
    }
    let component = non_empty_label(&kv.spec.product_component).unwrap_or(APP_COMPONENT);
    labels.insert(APP_COMPONENT_LABEL.to_string(), component.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_OPERATOR.to_string());

    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), target.version.clone());
    annotations.insert(INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(), target.registry.clone());
    annotations.insert(INSTALL_STRATEGY_ID_ANNOTATION.to_string(), target.id.clone());
    if with_generation {
        annotations.insert(
            GENERATION_ANNOTATION.to_string(),
            kv.metadata.generation.unwrap_or_default().to_string(),
        );
    }
}

/// True when `meta` was written by this operator for `target` at CR generation `generation`
pub fn object_matches_version(meta: &ObjectMeta, target: &TargetVersion, generation: i64) -> bool {
    let Some(annotations) = meta.annotations.as_ref() else {
        return false;
    };
    if let Some(found) = annotations.get(GENERATION_ANNOTATION) {
        if *found != generation.to_string() {
            return false;
        }
    }
    let get = |key: &str| annotations.get(key).map(String::as_str).unwrap_or_default();
    get(INSTALL_STRATEGY_VERSION_ANNOTATION) == target.version
        && get(INSTALL_STRATEGY_REGISTRY_ANNOTATION) == target.registry
        && get(INSTALL_STRATEGY_ID_ANNOTATION) == target.id
        && is_managed_by_operator(meta.labels.as_ref())
}

fn is_subset(required: Option<&BTreeMap<String, String>>, existing: Option<&BTreeMap<String, String>>) -> bool {
    let Some(required) = required else {
        return true;
    };
    required
        .iter()
        .all(|(k, v)| existing.and_then(|e| e.get(k)) == Some(v))
}

/// True when `existing` lacks one of the labels or annotations `required` carries
pub fn metadata_needs_update(existing: &ObjectMeta, required: &ObjectMeta) -> bool {
    !is_subset(required.labels.as_ref(), existing.labels.as_ref())
        || !is_subset(required.annotations.as_ref(), existing.annotations.as_ref())
}

/// Whether every field set in `desired` holds the same value in `live`. Unset and empty
/// fields match anything, so values defaulted by the API server are not drift.
pub fn is_derivative(desired: &Value, live: &Value) -> bool {
    match desired {
        Value::Null => true,
        Value::String(s) if s.is_empty() => true,
        Value::Object(fields) => fields
            .iter()
            .all(|(field, value)| is_derivative(value, live.get(field).unwrap_or(&Value::Null))),
        Value::Array(items) if items.is_empty() => true,
        Value::Array(items) => live
            .as_array()
            .is_some_and(|l| l.len() == items.len() && items.iter().zip(l).all(|(d, l)| is_derivative(d, l))),
        scalar => scalar == live,
    }
}

pub fn pointer(tokens: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(tokens.iter().copied())
}

/// `add` operations replacing the labels and annotations wholesale
pub fn labels_and_annotations_ops(meta: &ObjectMeta) -> Vec<PatchOperation> {
    vec![
        PatchOperation::Add(AddOperation {
            path: pointer(&["metadata", "labels"]),
            value: json!(meta.labels.clone().unwrap_or_default()),
        }),
        PatchOperation::Add(AddOperation {
            path: pointer(&["metadata", "annotations"]),
            value: json!(meta.annotations.clone().unwrap_or_default()),
        }),
    ]
}

/// Guards a patch against a concurrent writer
pub fn test_generation_op(generation: i64) -> PatchOperation {
    PatchOperation::Test(TestOperation {
        path: pointer(&["metadata", "generation"]),
        value: json!(generation),
    })
}

const NON_CONTENT_FIELDS: &[&str] = &["apiVersion", "kind", "metadata", "status"];

/// Operations bringing the top level fields of `current` to those of `desired`.
///
/// Fields are compared one by one unless `force` is set, in which case every desired
/// field is written.
pub fn content_ops(desired: &Value, current: &Value, force: bool) -> Vec<PatchOperation> {
    let Some(fields) = desired.as_object() else {
        return vec![];
    };
    fields
        .iter()
        .filter(|(field, _)| !NON_CONTENT_FIELDS.contains(&field.as_str()))
        .filter_map(|(field, value)| {
            let live = current.get(field);
            if !force && live == Some(value) {
                return None;
            }
            let path = pointer(&[field.as_str()]);
            Some(match live {
                Some(_) => PatchOperation::Replace(ReplaceOperation {
                    path,
                    value: value.clone(),
                }),
                None => PatchOperation::Add(AddOperation {
                    path,
                    value: value.clone(),
                }),
            })
        })
        .collect()
}

fn record_matches(record: &GenerationStatus, object: &ManagedObject) -> bool {
    let kind = object.kind();
    record.group == kind.group()
        && record.resource == kind.resource()
        && record.namespace.as_deref().unwrap_or_default() == object.namespace().unwrap_or_default()
        && record.name == object.name()
}

/// Generation recorded for `object`, or -1 when the operator never wrote it
pub fn expected_generation(kv: &KubeVirt, object: &ManagedObject) -> i64 {
    kv.status
        .as_ref()
        .and_then(|s| s.generations.as_ref())
        .and_then(|records| records.iter().find(|r| record_matches(r, object)))
        .map(|r| r.last_generation)
        .unwrap_or(-1)
}

/// Records the live generation of `object` after a write
pub fn set_generation(kv: &mut KubeVirt, object: &ManagedObject) {
    let generation = object.generation();
    let records = kv.status_mut().generations.get_or_insert_with(Vec::new);
    if let Some(record) = records.iter_mut().find(|r| record_matches(r, object)) {
        record.last_generation = generation;
        return;
    }
    let kind = object.kind();
    records.push(GenerationStatus {
        group: kind.group().to_string(),
        resource: kind.resource().to_string(),
        namespace: object.namespace().map(str::to_string),
        name: object.name().to_string(),
        last_generation: generation,
        hash: None,
    });
}
