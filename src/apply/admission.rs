use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::Value;
use tracing::*;

use super::Reconciler;
use super::meta::{inject_operator_metadata, object_matches_version};
use crate::components::admission::temporary_validating_webhook;
use crate::components::{CA_BUNDLE_KEY, KUBEVIRT_CA};
use crate::kinds::{Kind, ManagedObject};
use crate::Result;

impl Reconciler<'_> {
    /// Current bundle of the kubevirt CA, as published by the certificate manager
    pub(crate) fn ca_bundle(&self) -> Option<String> {
        let holder = self
            .strategy
            .config_maps()
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(KUBEVIRT_CA))?;
        match self
            .stores
            .get(Kind::ConfigMap, holder.metadata.namespace.as_deref(), KUBEVIRT_CA)
        {
            Some(ManagedObject::ConfigMap(cm)) => cm
                .data
                .and_then(|d| d.get(CA_BUNDLE_KEY).cloned())
                .filter(|b| !b.is_empty()),
            _ => None,
        }
    }

    /// Blocks creation of instances of CRDs that are new in this version until the new
    /// API server is rolled over
    pub(crate) async fn create_dummy_webhook_validator(&self) -> Result<()> {
        let generation = self.kv.metadata.generation.unwrap_or_default();
        let already_created = self
            .stores
            .list(Kind::ValidatingWebhook)
            .iter()
            .any(|w| object_matches_version(w.meta(), &self.target, generation));
        if already_created {
            return Ok(());
        }

        let new_crds: Vec<&CustomResourceDefinition> = self
            .strategy
            .crds()
            .iter()
            .filter(|crd| {
                let name = crd.metadata.name.as_deref().unwrap_or_default();
                self.stores.get(Kind::Crd, None, name).is_none()
            })
            .collect();
        let namespace = self.kv.metadata.namespace.clone().unwrap_or_default();
        let Some(mut webhook) = temporary_validating_webhook(&namespace, &new_crds) else {
            return Ok(());
        };
        inject_operator_metadata(self.kv, &mut webhook.metadata, &self.target, true);

        self.expectations
            .raise_expectations(Kind::ValidatingWebhook, &self.kv_key, 1, 0);
        if let Err(e) = self
            .client
            .create(&ManagedObject::ValidatingWebhook(webhook))
            .await
        {
            self.expectations
                .lower_expectations(Kind::ValidatingWebhook, &self.kv_key, 1, 0);
            return Err(e);
        }
        info!(
            "temporary validation webhook created for version {} and registry {}",
            self.target.version, self.target.registry
        );
        Ok(())
    }

    /// Cached object, falling back to a live read for objects that predate the
    /// managed-by label and are therefore invisible to the informer
    async fn cached_or_live(&self, object: &ManagedObject) -> Result<Option<ManagedObject>> {
        let key = object.key();
        if let Some(cached) = self.stores.get(key.kind, key.namespace.as_deref(), &key.name) {
            return Ok(Some(cached));
        }
        self.client.get(&key).await
    }

    pub(crate) async fn create_or_update_validating_webhooks(&mut self, ca_bundle: Option<&str>) -> Result<()> {
        let bundle = ca_bundle.map(|b| ByteString(b.as_bytes().to_vec()));
        for mut webhook in self.strategy.validating_webhooks().to_vec() {
            for hook in webhook.webhooks.iter_mut().flatten() {
                hook.client_config.ca_bundle = bundle.clone();
            }
            let desired = ManagedObject::ValidatingWebhook(webhook);
            let cached = self.cached_or_live(&desired).await?;
            let certs_match = match &cached {
                Some(ManagedObject::ValidatingWebhook(c)) => c
                    .webhooks
                    .iter()
                    .flatten()
                    .all(|h| h.client_config.ca_bundle == bundle),
                _ => true,
            };
            self.apply_against(desired, cached, !certs_match).await?;
        }
        Ok(())
    }

    pub(crate) async fn create_or_update_mutating_webhooks(&mut self, ca_bundle: Option<&str>) -> Result<()> {
        let bundle = ca_bundle.map(|b| ByteString(b.as_bytes().to_vec()));
        for mut webhook in self.strategy.mutating_webhooks().to_vec() {
            for hook in webhook.webhooks.iter_mut().flatten() {
                hook.client_config.ca_bundle = bundle.clone();
            }
            let desired = ManagedObject::MutatingWebhook(webhook);
            let cached = self.cached_or_live(&desired).await?;
            let certs_match = match &cached {
                Some(ManagedObject::MutatingWebhook(c)) => c
                    .webhooks
                    .iter()
                    .flatten()
                    .all(|h| h.client_config.ca_bundle == bundle),
                _ => true,
            };
            self.apply_against(desired, cached, !certs_match).await?;
        }
        Ok(())
    }

    pub(crate) async fn create_or_update_api_services(&mut self, ca_bundle: Option<&str>) -> Result<()> {
        let encoded = ca_bundle.map(|b| Value::String(STANDARD.encode(b)));
        for mut api_service in self.strategy.api_services().to_vec() {
            if let (Some(Value::Object(spec)), Some(bundle)) = (api_service.body.get_mut("spec"), encoded.as_ref()) {
                spec.insert("caBundle".to_string(), bundle.clone());
            }
            let desired = ManagedObject::ApiService(api_service);
            let cached = self.cached_or_live(&desired).await?;
            let certs_match = match &cached {
                Some(ManagedObject::ApiService(c)) => c.spec().and_then(|s| s.get("caBundle")) == encoded.as_ref(),
                _ => true,
            };
            self.apply_against(desired, cached, !certs_match).await?;
        }
        Ok(())
    }
}
