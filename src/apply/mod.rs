//! Converges the cluster to an install strategy.
//!
//! A [`Reconciler`] is built per pass. It reads the informer caches, writes through the
//! [`ClusterClient`], and records the generation of every tracked object it touched in
//! the CR status so the next pass can skip it.
use semver::Version;
use std::sync::Once;
use tracing::*;

use crate::client::ClusterClient;
use crate::crd::KubeVirt;
use crate::expectations::Expectations;
use crate::helper::is_valid_label;
use crate::install::Strategy;
use crate::stores::Stores;
use crate::Result;

mod admission;
mod apps;
mod crds;
pub mod customize;
mod delete;
pub mod meta;
mod monitoring;
mod resources;

pub use customize::Customizer;
pub use delete::{DELETE_ORDER, delete_all, delete_object};
pub use meta::{TargetVersion, inject_operator_metadata, object_matches_version};

static INVALID_LABELS_REPORTED: Once = Once::new();

pub struct Reconciler<'a> {
    kv: &'a mut KubeVirt,
    kv_key: String,
    target: TargetVersion,
    strategy: Strategy,
    stores: &'a Stores,
    client: &'a dyn ClusterClient,
    expectations: &'a Expectations,
}

impl<'a> Reconciler<'a> {
    /// Prepares a pass over `strategy` with the CR's component customizations applied
    pub fn new(
        kv: &'a mut KubeVirt,
        strategy: &Strategy,
        stores: &'a Stores,
        client: &'a dyn ClusterClient,
        expectations: &'a Expectations,
    ) -> Result<Self> {
        let kv_key = format!(
            "{}/{}",
            kv.metadata.namespace.as_deref().unwrap_or_default(),
            kv.metadata.name.as_deref().unwrap_or_default()
        );
        let strategy = Customizer::new(kv.patches())?.apply(strategy)?;
        Ok(Self {
            target: TargetVersion::of(kv),
            kv,
            kv_key,
            strategy,
            stores,
            client,
            expectations,
        })
    }

    fn report_invalid_product_labels(&self) {
        let spec = &self.kv.spec;
        let invalid: Vec<&str> = [
            spec.product_name.as_deref(),
            spec.product_version.as_deref(),
            spec.product_component.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|v| !v.is_empty() && !is_valid_label(v))
        .collect();
        if !invalid.is_empty() {
            INVALID_LABELS_REPORTED.call_once(|| {
                warn!("product labels {invalid:?} are not valid label values and are left out");
            });
        }
    }

    /// Runs one pass. Returns true once every object is at the target version and the
    /// leftovers of the previous version are pruned.
    pub async fn sync(&mut self) -> Result<bool> {
        self.report_invalid_product_labels();

        let api_rolled_over = self.api_deployments_rolled_over();
        let controllers_rolled_over = self.controller_deployments_rolled_over();
        let export_proxy_rolled_over =
            !self.kv.export_proxy_enabled() || self.export_proxy_deployments_rolled_over();
        let daemon_sets_rolled_over = self.daemon_sets_rolled_over();

        let status = self.kv.status_ref();
        let observed_version = status.observed_kube_virt_version.unwrap_or_default();
        let observed_registry = status.observed_kube_virt_registry.unwrap_or_default();
        let infra_rolled_over = (api_rolled_over
            && controllers_rolled_over
            && export_proxy_rolled_over
            && daemon_sets_rolled_over)
            || (self.target.version == observed_version && self.target.registry == observed_registry);

        if api_rolled_over {
            delete::delete_dummy_webhook_validators(&self.kv_key, self.stores, self.client, self.expectations)
                .await?;
        } else {
            self.create_dummy_webhook_validator().await?;
        }

        self.create_or_update_crds().await?;
        self.create_or_update_service_monitors().await?;
        self.create_or_update_prometheus_rules().await?;
        self.create_or_update_rbac().await?;
        self.create_or_update_sccs().await?;

        if self.create_or_update_services().await? {
            debug!("waiting on services to be replaced");
            return Ok(false);
        }

        self.create_or_update_components_with_certificates().await?;

        let finished = if should_take_update_path(&self.target.version, &observed_version) {
            self.update_kubevirt_system(controllers_rolled_over).await?
        } else {
            self.create_or_rollback_system(api_rolled_over).await?
        };
        if !finished {
            return Ok(false);
        }

        self.sync_kubevirt_namespace_labels().await?;

        if !infra_rolled_over {
            return Ok(false);
        }
        self.delete_objects_not_in_install_strategy().await?;
        Ok(true)
    }
}

/// Whether moving from `current` to `target` is an update rather than an install or a
/// rollback. Versions that are not semver are treated as updates.
pub fn should_take_update_path(target: &str, current: &str) -> bool {
    if current.is_empty() {
        return false;
    }
    let target = target.strip_prefix('v').unwrap_or(target);
    let current = current.strip_prefix('v').unwrap_or(current);
    match (Version::parse(target), Version::parse(current)) {
        (Ok(target), Ok(current)) => target > current,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::should_take_update_path;

    #[test]
    fn fresh_installs_create() {
        assert!(!should_take_update_path("v1.2.0", ""));
    }

    #[test]
    fn newer_semver_updates() {
        assert!(should_take_update_path("v1.2.0", "v1.1.9"));
        assert!(should_take_update_path("1.10.0", "v1.9.0"));
    }

    #[test]
    fn same_or_older_rolls_back() {
        assert!(!should_take_update_path("v1.2.0", "v1.2.0"));
        assert!(!should_take_update_path("v1.1.0", "v1.2.0"));
    }

    #[test]
    fn non_semver_defaults_to_update() {
        assert!(should_take_update_path("devel", "v1.2.0"));
        assert!(should_take_update_path("latest", "sha-abc"));
    }
}
