use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DeleteParams;
use std::sync::Arc;
use tracing::*;

use super::{JOB_RETRY_THROTTLE, KubeVirtController};
use crate::apply::{Reconciler, delete_object};
use crate::conditions::*;
use crate::config::{DeploymentConfig, KUBEVIRT_VERSION_ENV};
use crate::crd::{KUBEVIRT_FINALIZER, KubeVirt, KubeVirtPhase};
use crate::install::cache::cache_key;
use crate::install::job::{generate_install_strategy_job, job_completed, job_deployment_id};
use crate::install::{Strategy, load_install_strategy_from_cache};
use crate::kinds::{Kind, ManagedObject};
use crate::stores::{daemonset_is_ready, deployment_is_ready};
use crate::components::VIRT_EXPORTPROXY;
use crate::{Error, Result};

impl KubeVirtController {
    /// Rejects every CR while more than one exists, and a CR outside the operator
    /// namespace
    pub(super) fn check_for_active_install(&self, kv: &KubeVirt) -> Result<()> {
        let count = self.kubevirts.state().len();
        if count > 1 {
            return Err(Error::OtherError(format!(
                "{count} KubeVirt CRs detected, KubeVirt must only be installed once"
            )));
        }
        let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
        if namespace != self.operator_namespace {
            return Err(Error::OtherError(format!(
                "KubeVirt CR must be created in namespace {}, found it in {namespace}",
                self.operator_namespace
            )));
        }
        Ok(())
    }

    fn operator_version(&self) -> String {
        self.env
            .get(KUBEVIRT_VERSION_ENV)
            .unwrap_or(env!("CARGO_PKG_VERSION"))
            .to_string()
    }

    /// Loads the strategy for the CR's target configuration.
    ///
    /// Returns `None` while the strategy is being produced by a dump job; the pass is
    /// retriggered by the job or config map events.
    pub(super) async fn load_install_strategy(&self, kv: &KubeVirt) -> Result<Option<Arc<Strategy>>> {
        let config = DeploymentConfig::target_from_kv(kv, &self.env);
        let key = cache_key(config.deployment_id(), kv.metadata.generation.unwrap_or_default());
        if let Some(strategy) = self.strategy_cache.get(&key) {
            return Ok(Some(strategy));
        }

        let config_maps: Vec<ConfigMap> = self
            .stores
            .install_strategy_config_maps
            .state()
            .iter()
            .map(|cm| (**cm).clone())
            .collect();
        match load_install_strategy_from_cache(&config_maps, &config) {
            Ok(strategy) => {
                info!(
                    "loaded install strategy for version {} with registry {}",
                    config.kube_virt_version, config.registry
                );
                let strategy = Arc::new(strategy);
                self.strategy_cache.put(key, strategy.clone());
                return Ok(Some(strategy));
            }
            Err(e) => debug!("no usable install strategy config map yet: {e}"),
        }

        let kv_key = Self::kv_key(kv);
        let job = self
            .stores
            .install_strategy_jobs
            .state()
            .into_iter()
            .find(|job| job_deployment_id(job) == config.deployment_id());
        if let Some(job) = job {
            let completed_at = job.status.as_ref().and_then(|s| s.completion_time.as_ref());
            if let (true, Some(completed_at)) = (job_completed(&job), completed_at) {
                let elapsed = (Utc::now() - completed_at.0).to_std().unwrap_or_default();
                if elapsed < JOB_RETRY_THROTTLE {
                    self.queue.add_after(&kv_key, JOB_RETRY_THROTTLE - elapsed);
                } else if job.metadata.deletion_timestamp.is_none() {
                    info!(
                        "install strategy job {} completed without a strategy, deleting it to retry",
                        job.metadata.name.as_deref().unwrap_or_default()
                    );
                    let job = ManagedObject::InstallStrategyJob((*job).clone());
                    delete_object(&kv_key, self.client.as_ref(), &self.expectations, &job, &DeleteParams::foreground())
                        .await?;
                }
            }
            return Ok(None);
        }

        let job = generate_install_strategy_job(&config, &self.operator_namespace, kv.spec.infra.as_ref())?;
        self.expectations
            .raise_expectations(Kind::InstallStrategyJob, &kv_key, 1, 0);
        match self.client.create(&ManagedObject::InstallStrategyJob(job)).await {
            Ok(created) => {
                info!(
                    "created job {} to generate the install strategy for version {} with registry {}",
                    created.name(),
                    config.kube_virt_version,
                    config.registry
                );
                Ok(None)
            }
            Err(e) => {
                self.expectations
                    .lower_expectations(Kind::InstallStrategyJob, &kv_key, 1, 0);
                Err(e)
            }
        }
    }

    /// Foreground deletes every completed strategy job
    pub(super) async fn garbage_collect_install_strategy_jobs(&self, kv_key: &str) -> Result<()> {
        for job in self.stores.install_strategy_jobs.state() {
            if !job_completed(&job) || job.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let job = ManagedObject::InstallStrategyJob((*job).clone());
            delete_object(kv_key, self.client.as_ref(), &self.expectations, &job, &DeleteParams::foreground()).await?;
            debug!("garbage collected install strategy job {}", job.name());
        }
        Ok(())
    }

    /// Deletes every stored strategy and forgets the cached one
    pub(super) async fn delete_all_install_strategy(&self, kv_key: &str) -> Result<()> {
        for config_map in self.stores.install_strategy_config_maps.state() {
            if config_map.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let config_map = ManagedObject::InstallStrategyConfigMap((*config_map).clone());
            delete_object(kv_key, self.client.as_ref(), &self.expectations, &config_map, &DeleteParams::default())
                .await?;
        }
        self.strategy_cache.reset();
        Ok(())
    }

    /// Every deployment and daemonset of the strategy runs the target version
    fn is_ready(&self, kv: &KubeVirt, strategy: &Strategy) -> bool {
        let export_proxy = kv.export_proxy_enabled();
        let deployments_ready = strategy
            .deployments()
            .iter()
            .filter(|d| export_proxy || d.metadata.name.as_deref() != Some(VIRT_EXPORTPROXY))
            .all(|d| deployment_is_ready(kv, d, &self.stores));
        deployments_ready
            && strategy
                .daemon_sets()
                .iter()
                .all(|ds| daemonset_is_ready(kv, ds, &self.stores))
    }

    pub(super) async fn sync_installation(&self, kv: &mut KubeVirt) -> Result<()> {
        if let Err(e) = self.check_for_active_install(kv) {
            warn!("ignoring the install request until the situation is resolved: {e}");
            update_conditions_failed_exists(kv);
            return Ok(());
        }

        let config = DeploymentConfig::target_from_kv(kv, &self.env);
        kv.status_mut().operator_version = Some(self.operator_version());
        config.set_target(kv)?;

        if kv.status_ref().phase.is_none() {
            kv.status_mut().phase = Some(KubeVirtPhase::Deploying);
            self.client
                .publish_event(
                    kv,
                    false,
                    "DeploymentStarted",
                    "Deploying",
                    format!("Deploying KubeVirt version {}", config.kube_virt_version),
                )
                .await;
        }
        if kv.is_updating() {
            update_conditions_updating(kv);
        } else {
            update_conditions_deploying(kv);
        }

        let strategy = match self.load_install_strategy(kv).await {
            Ok(Some(strategy)) => strategy,
            Ok(None) => return Ok(()),
            Err(e) => {
                update_conditions_failed_error(kv, &e);
                return Err(e);
            }
        };

        let finalizers = kv.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == KUBEVIRT_FINALIZER) {
            finalizers.push(KUBEVIRT_FINALIZER.to_string());
        }

        let kv_key = Self::kv_key(kv);
        self.garbage_collect_install_strategy_jobs(&kv_key).await?;

        let synced = match self.reconcile(kv, &strategy).await {
            Ok(synced) => synced,
            Err(e) => {
                update_conditions_failed_error(kv, &e);
                self.client
                    .publish_event(kv, true, "DeploymentFailed", "Deploying", e.to_string())
                    .await;
                return Err(e);
            }
        };
        if !synced {
            debug!("install of {} is still in progress", config.kube_virt_version);
            return Ok(());
        }

        config.set_observed(kv)?;
        update_conditions_created(kv);
        if self.is_ready(kv, &strategy) {
            info!("all KubeVirt components are ready");
            if kv.status_ref().phase != Some(KubeVirtPhase::Deployed) {
                self.client
                    .publish_event(
                        kv,
                        false,
                        "Deployed",
                        "Deploying",
                        format!("KubeVirt version {} is deployed", config.kube_virt_version),
                    )
                    .await;
            }
            kv.status_mut().phase = Some(KubeVirtPhase::Deployed);
            update_conditions_available(kv);
            kv.status_mut().observed_generation = kv.metadata.generation;
        }
        Ok(())
    }

    async fn reconcile(&self, kv: &mut KubeVirt, strategy: &Strategy) -> Result<bool> {
        let mut reconciler = Reconciler::new(kv, strategy, &self.stores, self.client.as_ref(), &self.expectations)?;
        reconciler.sync().await
    }
}
