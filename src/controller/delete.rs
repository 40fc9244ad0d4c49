use tracing::*;

use super::KubeVirtController;
use crate::apply::delete_all;
use crate::conditions::*;
use crate::crd::{KubeVirt, KubeVirtPhase};
use crate::Result;

impl KubeVirtController {
    pub(super) async fn sync_deletion(&self, kv: &mut KubeVirt) -> Result<()> {
        info!("handling deletion");
        if let Err(e) = self.check_for_active_install(kv) {
            warn!("ignoring the delete request until the situation is resolved: {e}");
            update_conditions_failed_exists(kv);
            return Ok(());
        }

        if kv.status_ref().phase != Some(KubeVirtPhase::Deleting) {
            self.client
                .publish_event(kv, false, "DeletionStarted", "Deleting", "Removing KubeVirt".to_string())
                .await;
        }
        kv.status_mut().phase = Some(KubeVirtPhase::Deleting);
        update_conditions_deleting(kv);

        let kv_key = Self::kv_key(kv);
        if !self.stores.all_empty() {
            if self.load_install_strategy(kv).await?.is_none() {
                return Ok(());
            }
            if let Err(e) = delete_all(&kv_key, &self.stores, self.client.as_ref(), &self.expectations).await {
                update_conditions_deletion_failed(kv, &e);
                self.client
                    .publish_event(kv, true, "DeletionFailed", "Deleting", e.to_string())
                    .await;
                return Err(e);
            }
        }

        // clears a previous deletion failure
        update_conditions_deleting(kv);

        if !self.stores.all_empty() {
            debug!(
                "waiting for {} objects to be removed",
                self.stores.managed_object_count()
            );
            return Ok(());
        }

        self.delete_all_install_strategy(&kv_key).await?;
        self.garbage_collect_install_strategy_jobs(&kv_key).await?;
        kv.status_mut().phase = Some(KubeVirtPhase::Deleted);
        if let Some(finalizers) = kv.metadata.finalizers.as_mut() {
            finalizers.clear();
        }
        info!("KubeVirt is removed");
        Ok(())
    }
}
