//! The KubeVirt controller: a rate limited work queue of CR keys drained by a pool of
//! workers, each running [`KubeVirtController::execute`] to completion.
use chrono::{DateTime, Utc};
use json_patch::{PatchOperation, ReplaceOperation};
use kube::api::Patch;
use kube::runtime::reflector::{ObjectRef, Store};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::client::ClusterClient;
use crate::conditions::set_condition_timestamps;
use crate::config::Env;
use crate::crd::KubeVirt;
use crate::expectations::Expectations;
use crate::install::StrategyCache;
use crate::stores::Stores;
use crate::workqueue::{RateLimiter, WorkQueue};
use crate::{Error, Result};

mod delete;
mod handlers;
pub mod informer;
mod install;
#[cfg(test)]
mod tests;

pub use handlers::ObjectEventHandler;

/// Delay between an object event and the pass it triggers, so bursts collapse into one
pub const OBJECT_EVENT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Completed strategy jobs are kept this long before one is retried
pub const JOB_RETRY_THROTTLE: Duration = Duration::from_secs(10);

pub static LATEST_OBSERVED_API_VERSION_ANNOTATION: &str = "kubevirt.io/latest-observed-api-version";
pub static STORAGE_OBSERVED_API_VERSION_ANNOTATION: &str = "kubevirt.io/storage-observed-api-version";
pub static KUBEVIRT_API_VERSION: &str = "v1";

/// Served by the health endpoint
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    pub last_reconcile: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub queue_length: usize,
}

pub struct KubeVirtController {
    queue: WorkQueue,
    kubevirts: Store<KubeVirt>,
    stores: Stores,
    client: Arc<dyn ClusterClient>,
    expectations: Expectations,
    strategy_cache: Arc<StrategyCache>,
    env: Env,
    operator_namespace: String,
    last_reconcile: RwLock<(Option<DateTime<Utc>>, Option<String>)>,
}

impl KubeVirtController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        kubevirts: Store<KubeVirt>,
        stores: Stores,
        env: Env,
        operator_namespace: String,
        strategy_cache: Arc<StrategyCache>,
    ) -> Self {
        Self {
            queue: WorkQueue::new(RateLimiter::default()),
            kubevirts,
            stores,
            client,
            expectations: Expectations::default(),
            strategy_cache,
            env,
            operator_namespace,
            last_reconcile: RwLock::new((None, None)),
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let (last_reconcile, last_error) = self.last_reconcile.read().clone();
        Diagnostics {
            last_reconcile,
            last_error,
            queue_length: self.queue.len(),
        }
    }

    async fn wait_for_caches(&self) -> Result<()> {
        self.kubevirts
            .wait_until_ready()
            .await
            .map_err(|e| Error::OtherError(format!("KubeVirt cache: {e}")))?;
        self.stores.wait_until_ready().await
    }

    /// Starts `threadiness` workers once every cache is synced and runs until `cancel` fires
    pub async fn run(self: Arc<Self>, threadiness: usize, cancel: CancellationToken) -> Result<()> {
        info!("starting KubeVirt controller");
        tokio::select! {
            synced = self.wait_for_caches() => synced?,
            _ = cancel.cancelled() => {
                self.queue.shut_down();
                return Ok(());
            }
        }
        info!("caches synced, starting {threadiness} workers");

        let workers: Vec<_> = (0..threadiness.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.execute_next().await {} })
            })
            .collect();

        cancel.cancelled().await;
        info!("stopping KubeVirt controller");
        self.queue.shut_down();
        for worker in futures::future::join_all(workers).await {
            if let Err(e) = worker {
                error!("worker panicked: {e}");
            }
        }
        Ok(())
    }

    /// Processes one key. Returns false once the queue is shut down.
    pub async fn execute_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let span = info_span!("reconcile", kubevirt = %key);
        let result = self.execute(&key).instrument(span).await;
        match &result {
            Ok(()) => {
                debug!("reconciled KubeVirt {key}");
                self.queue.forget(&key);
            }
            Err(e) => {
                error!("reconciling KubeVirt {key} failed: {e}");
                self.queue.add_rate_limited(&key);
            }
        }
        *self.last_reconcile.write() = (Some(Utc::now()), result.err().map(|e| e.to_string()));
        self.queue.done(&key);
        true
    }

    fn kubevirt(&self, key: &str) -> Option<Arc<KubeVirt>> {
        let (namespace, name) = key.split_once('/')?;
        self.kubevirts.get(&ObjectRef::new(name).within(namespace))
    }

    /// One pass over the CR stored under `key`
    pub async fn execute(&self, key: &str) -> Result<()> {
        let Some(kv) = self.kubevirt(key) else {
            debug!("KubeVirt {key} no longer exists");
            self.expectations.delete_expectations(key);
            return Ok(());
        };

        if !has_api_version_annotations(&kv) {
            let mut stamped = (*kv).clone();
            let annotations = stamped.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(LATEST_OBSERVED_API_VERSION_ANNOTATION.to_string(), KUBEVIRT_API_VERSION.to_string());
            annotations.insert(STORAGE_OBSERVED_API_VERSION_ANNOTATION.to_string(), KUBEVIRT_API_VERSION.to_string());
            self.client.update_kubevirt(&stamped).await?;
            return Ok(());
        }

        if !self.expectations.all_satisfied(key) {
            debug!(
                "waiting for expectations of {:?} to be fulfilled",
                self.expectations.unsatisfied_kinds(key)
            );
            return Ok(());
        }
        self.expectations.reset(key);

        let mut updated = (*kv).clone();
        let synced = if kv.metadata.deletion_timestamp.is_some() {
            self.sync_deletion(&mut updated).await
        } else {
            self.sync_installation(&mut updated).await
        };

        set_condition_timestamps(&kv, &mut updated);
        if updated.status != kv.status {
            self.client.update_kubevirt_status(&updated).await?;
        }
        if updated.metadata.finalizers != kv.metadata.finalizers {
            let patch = Patch::Json(json_patch::Patch(vec![PatchOperation::Replace(ReplaceOperation {
                path: crate::apply::meta::pointer(&["metadata", "finalizers"]),
                value: serde_json::to_value(updated.metadata.finalizers.clone().unwrap_or_default())?,
            })]));
            let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
            let name = kv.metadata.name.as_deref().unwrap_or_default();
            self.client.patch_kubevirt(namespace, name, &patch).await?;
        }
        synced
    }

    pub(crate) fn kv_key(kv: &KubeVirt) -> String {
        format!(
            "{}/{}",
            kv.metadata.namespace.as_deref().unwrap_or_default(),
            kv.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

fn has_api_version_annotations(kv: &KubeVirt) -> bool {
    kv.metadata.annotations.as_ref().is_some_and(|a| {
        a.contains_key(LATEST_OBSERVED_API_VERSION_ANNOTATION) && a.contains_key(STORAGE_OBSERVED_API_VERSION_ANNOTATION)
    })
}
