//! Rollout of the infrastructure workloads.
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::DeleteParams;
use tracing::*;

use super::Reconciler;
use super::meta::inject_operator_metadata;
use crate::components::placement::{NodePlacementPolicy, inject_placement_metadata};
use crate::components::workloads::pdb_for_deployment;
use crate::kinds::{Kind, ManagedObject};
use crate::stores::{daemonset_is_ready, deployment_is_ready};
use crate::Result;

#[derive(Clone, Copy, Debug)]
enum DeploymentGroup {
    Api,
    Controller,
    ExportProxy,
}

impl Reconciler<'_> {
    fn deployments_of(&self, group: DeploymentGroup) -> Vec<Deployment> {
        let deployments = match group {
            DeploymentGroup::Api => self.strategy.api_deployments(),
            DeploymentGroup::Controller => self.strategy.controller_deployments(),
            DeploymentGroup::ExportProxy => self.strategy.export_proxy_deployments(),
        };
        deployments.into_iter().cloned().collect()
    }

    pub(crate) fn api_deployments_rolled_over(&self) -> bool {
        self.deployments_rolled_over(self.strategy.api_deployments())
    }

    pub(crate) fn controller_deployments_rolled_over(&self) -> bool {
        self.deployments_rolled_over(self.strategy.controller_deployments())
    }

    pub(crate) fn export_proxy_deployments_rolled_over(&self) -> bool {
        self.deployments_rolled_over(self.strategy.export_proxy_deployments())
    }

    fn deployments_rolled_over(&self, deployments: Vec<&Deployment>) -> bool {
        for deployment in deployments {
            if !deployment_is_ready(self.kv, deployment, self.stores) {
                debug!(
                    "waiting on deployment {} to roll over to the latest version",
                    deployment.metadata.name.as_deref().unwrap_or_default()
                );
                return false;
            }
        }
        true
    }

    pub(crate) fn daemon_sets_rolled_over(&self) -> bool {
        for daemon_set in self.strategy.daemon_sets() {
            if !daemonset_is_ready(self.kv, daemon_set, self.stores) {
                debug!(
                    "waiting on daemonset {} to roll over to the latest version",
                    daemon_set.metadata.name.as_deref().unwrap_or_default()
                );
                return false;
            }
        }
        true
    }

    /// Target deployment with pod metadata, infra placement and replica override applied
    fn prepare_deployment(&self, deployment: &Deployment) -> Deployment {
        let mut deployment = deployment.clone();
        let infra = self.kv.spec.infra.as_ref();
        if let Some(spec) = deployment.spec.as_mut() {
            if let Some(replicas) = infra.and_then(|c| c.replicas) {
                spec.replicas = Some(i32::from(replicas));
            }
            let template = &mut spec.template;
            inject_operator_metadata(
                self.kv,
                template.metadata.get_or_insert_with(Default::default),
                &self.target,
                false,
            );
            if let Some(pod) = template.spec.as_mut() {
                inject_placement_metadata(infra, pod, NodePlacementPolicy::AnyNode);
            }
        }
        deployment
    }

    /// Syncs a deployment together with its disruption budget
    pub(crate) async fn sync_deployment(&mut self, deployment: &Deployment) -> Result<()> {
        let deployment = self.prepare_deployment(deployment);
        self.apply_object(ManagedObject::Deployment(deployment.clone()), false)
            .await?;
        self.sync_pod_disruption_budget(&deployment).await
    }

    async fn sync_pod_disruption_budget(&mut self, deployment: &Deployment) -> Result<()> {
        if let Some(pdb) = pdb_for_deployment(deployment) {
            self.apply_object(ManagedObject::PodDisruptionBudget(pdb), false)
                .await?;
            return Ok(());
        }
        // single replica deployments carry no budget
        let name = format!("{}-pdb", deployment.metadata.name.as_deref().unwrap_or_default());
        let namespace = deployment.metadata.namespace.as_deref();
        if let Some(cached) = self.stores.get(Kind::PodDisruptionBudget, namespace, &name) {
            self.delete_if_exists(&cached, &DeleteParams::default()).await?;
        }
        Ok(())
    }

    pub(crate) async fn delete_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.delete_if_exists(&ManagedObject::Deployment(deployment.clone()), &DeleteParams::default())
            .await
    }

    /// Returns whether the daemonset runs the target version on every node
    pub(crate) async fn sync_daemon_set(&mut self, daemon_set: &DaemonSet) -> Result<bool> {
        let mut daemon_set = daemon_set.clone();
        let workloads = self.kv.spec.workloads.as_ref();
        if let Some(spec) = daemon_set.spec.as_mut() {
            inject_operator_metadata(
                self.kv,
                spec.template.metadata.get_or_insert_with(Default::default),
                &self.target,
                false,
            );
            if let Some(pod) = spec.template.spec.as_mut() {
                inject_placement_metadata(workloads, pod, NodePlacementPolicy::AnyNode);
            }
        }
        self.apply_object(ManagedObject::DaemonSet(daemon_set.clone()), false)
            .await?;
        Ok(daemonset_is_ready(self.kv, &daemon_set, self.stores))
    }

    async fn sync_export_proxy(&mut self) -> Result<()> {
        let enabled = self.kv.export_proxy_enabled();
        for deployment in self.deployments_of(DeploymentGroup::ExportProxy) {
            if enabled {
                self.sync_deployment(&deployment).await?;
            } else {
                self.delete_deployment(&deployment).await?;
            }
        }
        Ok(())
    }

    /// API servers, then controllers and handlers once the API servers rolled over
    pub(crate) async fn create_or_rollback_system(&mut self, api_rolled_over: bool) -> Result<bool> {
        for deployment in self.deployments_of(DeploymentGroup::Api) {
            self.sync_deployment(&deployment).await?;
        }
        if !api_rolled_over {
            return Ok(false);
        }
        for deployment in self.deployments_of(DeploymentGroup::Controller) {
            self.sync_deployment(&deployment).await?;
        }
        self.sync_export_proxy().await?;
        for daemon_set in self.strategy.daemon_sets().to_vec() {
            if !self.sync_daemon_set(&daemon_set).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Handlers, then controllers, then the API servers once the controllers rolled over
    pub(crate) async fn update_kubevirt_system(&mut self, controllers_rolled_over: bool) -> Result<bool> {
        for daemon_set in self.strategy.daemon_sets().to_vec() {
            if !self.sync_daemon_set(&daemon_set).await? {
                return Ok(false);
            }
        }
        for deployment in self.deployments_of(DeploymentGroup::Controller) {
            self.sync_deployment(&deployment).await?;
        }
        if !controllers_rolled_over {
            return Ok(false);
        }
        self.sync_export_proxy().await?;
        for deployment in self.deployments_of(DeploymentGroup::Api) {
            self.sync_deployment(&deployment).await?;
        }
        Ok(true)
    }
}
