use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use tracing::*;

async fn emit<R: Resource<DynamicType = ()> + ResourceExt>(
    recorder: &Recorder,
    obj: &R,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let res = recorder
        .publish(
            &Event {
                type_,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await;
    if let Err(e) = res {
        debug!("failed to publish event {reason} for {}: {e}", obj.name_any());
    }
}

/// Publish a simple Normal event with given reason and note, ignoring errors.
pub async fn emit_info<R: Resource<DynamicType = ()> + ResourceExt>(
    recorder: &Recorder,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<Option<String>>,
) {
    emit(recorder, obj, EventType::Normal, reason, action, note.into()).await;
}

/// Publish a Warning event, ignoring errors.
pub async fn emit_warning<R: Resource<DynamicType = ()> + ResourceExt>(
    recorder: &Recorder,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<Option<String>>,
) {
    emit(recorder, obj, EventType::Warning, reason, action, note.into()).await;
}
