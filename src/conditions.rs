use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::{ConditionType, KubeVirt, KubeVirtCondition};

pub static REASON_DEPLOYMENT_FAILED_EXISTING: &str = "DeploymentFailedExisting";
pub static REASON_DEPLOYMENT_FAILED: &str = "DeploymentFailed";
pub static REASON_DELETION_FAILED: &str = "DeletionFailed";
pub static REASON_ALL_RESOURCES_CREATED: &str = "AllResourcesCreated";
pub static REASON_ALL_COMPONENTS_READY: &str = "AllComponentsReady";
pub static REASON_DEPLOYMENT_IN_PROGRESS: &str = "DeploymentInProgress";
pub static REASON_UPDATE_IN_PROGRESS: &str = "UpdateInProgress";
pub static REASON_DELETION_IN_PROGRESS: &str = "DeletionInProgress";

// A trait for types that expose KubeVirt style conditions
pub trait Conditions {
    fn conditions(&self) -> &[KubeVirtCondition];
    fn conditions_mut(&mut self) -> &mut Vec<KubeVirtCondition>;

    fn condition(&self, type_: ConditionType) -> Option<&KubeVirtCondition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions_mut().retain(|c| c.type_ != type_);
    }

    // Insert or update a condition in place. Timestamps are left alone and settled by
    // `set_condition_timestamps` once the pass is over.
    fn upsert_bool(&mut self, type_: ConditionType, status: bool, reason: &str, message: &str) {
        let status = if status { "True" } else { "False" };
        let conditions = self.conditions_mut();
        match conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                c.status = status.to_string();
                c.reason = Some(reason.to_string());
                c.message = Some(message.to_string());
            }
            None => conditions.push(KubeVirtCondition {
                type_,
                status: status.to_string(),
                last_probe_time: None,
                last_transition_time: None,
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            }),
        }
    }
}

impl Conditions for KubeVirt {
    fn conditions(&self) -> &[KubeVirtCondition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<KubeVirtCondition> {
        self.status_mut().conditions.get_or_insert_with(Vec::new)
    }
}

fn progress(kv: &mut KubeVirt, available: bool, progressing: bool, degraded: bool, reason: &str, msg: &str) {
    kv.upsert_bool(ConditionType::Available, available, reason, msg);
    kv.upsert_bool(ConditionType::Progressing, progressing, reason, msg);
    kv.upsert_bool(ConditionType::Degraded, degraded, reason, msg);
}

pub fn update_conditions_deploying(kv: &mut KubeVirt) {
    kv.remove_condition(ConditionType::Synchronized);
    let status = kv.status_ref();
    let msg = format!(
        "Deploying version {} with registry {}",
        status.target_kube_virt_version.unwrap_or_default(),
        status.target_kube_virt_registry.unwrap_or_default()
    );
    progress(kv, false, true, false, REASON_DEPLOYMENT_IN_PROGRESS, &msg);
}

pub fn update_conditions_updating(kv: &mut KubeVirt) {
    kv.remove_condition(ConditionType::Synchronized);
    let status = kv.status_ref();
    let msg = format!(
        "Transitioning from previous version {} with registry {} to target version {} using registry {}",
        status.observed_kube_virt_version.unwrap_or_default(),
        status.observed_kube_virt_registry.unwrap_or_default(),
        status.target_kube_virt_version.unwrap_or_default(),
        status.target_kube_virt_registry.unwrap_or_default()
    );
    progress(kv, true, true, true, REASON_UPDATE_IN_PROGRESS, &msg);
}

pub fn update_conditions_created(kv: &mut KubeVirt) {
    kv.upsert_bool(
        ConditionType::Created,
        true,
        REASON_ALL_RESOURCES_CREATED,
        "All resources were created.",
    );
}

pub fn update_conditions_available(kv: &mut KubeVirt) {
    kv.remove_condition(ConditionType::Synchronized);
    progress(kv, true, false, false, REASON_ALL_COMPONENTS_READY, "All components are ready.");
}

pub fn update_conditions_failed_exists(kv: &mut KubeVirt) {
    kv.upsert_bool(
        ConditionType::Synchronized,
        false,
        REASON_DEPLOYMENT_FAILED_EXISTING,
        "There is an active KubeVirt deployment",
    );
}

pub fn update_conditions_failed_error(kv: &mut KubeVirt, err: &crate::Error) {
    kv.upsert_bool(
        ConditionType::Synchronized,
        false,
        REASON_DEPLOYMENT_FAILED,
        &format!("An error occurred during deployment: {err}"),
    );
}

pub fn update_conditions_deleting(kv: &mut KubeVirt) {
    kv.remove_condition(ConditionType::Synchronized);
    progress(kv, false, false, true, REASON_DELETION_IN_PROGRESS, "Processing deletion.");
}

pub fn update_conditions_deletion_failed(kv: &mut KubeVirt, err: &crate::Error) {
    kv.upsert_bool(
        ConditionType::Synchronized,
        false,
        REASON_DELETION_FAILED,
        &format!("An error occurred during deletion: {err}"),
    );
}

/// Carries timestamps over from `orig` for conditions whose content did not change and
/// stamps the rest with the current time.
pub fn set_condition_timestamps(orig: &KubeVirt, updated: &mut KubeVirt) {
    let now = Time(chrono::Utc::now());
    let previous = orig.conditions().to_vec();
    for c in updated.conditions_mut().iter_mut() {
        match previous.iter().find(|p| p.type_ == c.type_) {
            Some(p) if p.status == c.status && p.reason == c.reason && p.message == c.message => {
                c.last_probe_time = p.last_probe_time.clone();
                c.last_transition_time = p.last_transition_time.clone();
            }
            _ => {
                c.last_probe_time = Some(now.clone());
                c.last_transition_time = Some(now.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeVirtSpec;

    fn kv() -> KubeVirt {
        KubeVirt::new("kubevirt", KubeVirtSpec::default())
    }

    fn status_of(kv: &KubeVirt, t: ConditionType) -> Option<&str> {
        kv.condition(t).map(|c| c.status.as_str())
    }

    #[test]
    fn deploying_clears_failure_and_marks_progress() {
        let mut kv = kv();
        update_conditions_failed_exists(&mut kv);
        assert_eq!(status_of(&kv, ConditionType::Synchronized), Some("False"));

        update_conditions_deploying(&mut kv);
        assert_eq!(status_of(&kv, ConditionType::Synchronized), None);
        assert_eq!(status_of(&kv, ConditionType::Available), Some("False"));
        assert_eq!(status_of(&kv, ConditionType::Progressing), Some("True"));
        assert_eq!(status_of(&kv, ConditionType::Degraded), Some("False"));
    }

    #[test]
    fn available_after_update() {
        let mut kv = kv();
        update_conditions_updating(&mut kv);
        assert_eq!(status_of(&kv, ConditionType::Degraded), Some("True"));
        update_conditions_available(&mut kv);
        let available = kv.condition(ConditionType::Available).unwrap();
        assert_eq!(available.status, "True");
        assert_eq!(available.reason.as_deref(), Some(REASON_ALL_COMPONENTS_READY));
        assert_eq!(kv.conditions().len(), 3);
    }

    #[test]
    fn timestamps_survive_unchanged_conditions() {
        let mut orig = kv();
        update_conditions_deploying(&mut orig);
        set_condition_timestamps(&kv(), &mut orig);
        let stamped = orig.condition(ConditionType::Available).unwrap().clone();
        assert!(stamped.last_transition_time.is_some());

        let mut updated = orig.clone();
        update_conditions_deploying(&mut updated);
        update_conditions_created(&mut updated);
        set_condition_timestamps(&orig, &mut updated);
        assert_eq!(updated.condition(ConditionType::Available), Some(&stamped));
        assert!(updated
            .condition(ConditionType::Created)
            .unwrap()
            .last_probe_time
            .is_some());
        assert_eq!(orig.status, {
            let mut again = orig.clone();
            update_conditions_deploying(&mut again);
            set_condition_timestamps(&orig, &mut again);
            again.status
        });
    }
}
