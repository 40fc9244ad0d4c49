//! User supplied patches from `spec.customizeComponents`.
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::*;

use crate::crd::{CustomizeComponentsPatch, PatchType};
use crate::install::Strategy;
use crate::kinds::{CUSTOMIZER_ID_ANNOTATION, ManagedObject};
use crate::{Error, Result};

pub struct Customizer {
    patches: Vec<CustomizeComponentsPatch>,
    hash: String,
}

impl Customizer {
    pub fn new(patches: Vec<CustomizeComponentsPatch>) -> Result<Self> {
        let encoded = serde_json::to_vec(&patches)?;
        let hash = hex::encode(Sha1::digest(&encoded));
        Ok(Self { patches, hash })
    }

    /// Identifier stamped on every patched object
    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn patches_for(&self, api_kind: &str, name: &str) -> Vec<&CustomizeComponentsPatch> {
        self.patches
            .iter()
            .filter(|p| p.resource_type.eq_ignore_ascii_case(api_kind))
            .filter(|p| p.resource_name == "*" || p.resource_name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// Applies the matching patches to a single object, returning whether any matched
    pub fn apply_to(&self, object: &mut ManagedObject) -> Result<bool> {
        let patches = self.patches_for(object.kind().api_kind(), object.name());
        if patches.is_empty() {
            return Ok(false);
        }
        let mut value = object.to_value()?;
        for patch in patches {
            apply_patch(&mut value, patch)?;
        }
        let mut patched = ManagedObject::from_value(object.kind(), value)?;
        patched
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(CUSTOMIZER_ID_ANNOTATION.to_string(), self.hash.clone());
        *object = patched;
        Ok(true)
    }

    /// Returns a copy of `strategy` with every patch applied
    pub fn apply(&self, strategy: &Strategy) -> Result<Strategy> {
        if self.patches.is_empty() {
            return Ok(strategy.clone());
        }
        let mut customized = Strategy::default();
        for mut object in strategy.objects() {
            if self.apply_to(&mut object)? {
                debug!("customized {}", object.key());
            }
            customized.push(object)?;
        }
        Ok(customized)
    }
}

fn apply_patch(value: &mut Value, patch: &CustomizeComponentsPatch) -> Result<()> {
    match patch.type_ {
        PatchType::Json => {
            let ops: json_patch::Patch = serde_json::from_str(&patch.patch)?;
            json_patch::patch(value, &ops).map_err(Error::PatchError)
        }
        // strategic merge needs the openapi schema; a json merge is the closest we get
        PatchType::Merge | PatchType::Strategic => {
            let merge: Value = serde_json::from_str(&patch.patch)?;
            json_patch::merge(value, &merge);
            Ok(())
        }
    }
}
