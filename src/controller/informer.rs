//! Watch loops feeding the reflector caches and the controller's event handlers.
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{ObjectRef, store::Writer};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::*;

use super::{KubeVirtController, ObjectEventHandler};
use crate::crd::KubeVirt;
use crate::kinds::{Kind, ManagedObject};

async fn api_available<K>(api: &Api<K>) -> bool
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.list_metadata(&ListParams::default().limit(1)).await {
        Err(kube::Error::Api(resp)) if resp.code == 404 => false,
        _ => true,
    }
}

/// Runs the informer of `kind` until the watch stream ends.
///
/// Every event is applied to the cache before the handler sees it, so handlers and the
/// passes they trigger observe the new state. Objects that disappear across a relist
/// are reported as deletions.
pub async fn watch<K>(
    api: Api<K>,
    kind: Kind,
    mut writer: Writer<K>,
    wrap: fn(K) -> ManagedObject,
    handler: Arc<dyn ObjectEventHandler>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    if kind.is_optional() && !api_available(&api).await {
        info!(%kind, "api not served by this cluster, using an empty cache");
        writer.apply_watcher_event(&Event::Init);
        writer.apply_watcher_event(&Event::InitDone);
        return;
    }

    let mut config = watcher::Config::default();
    if !kind.label_selector().is_empty() {
        config = config.labels(kind.label_selector());
    }
    let reader = writer.as_reader();
    let mut before_relist = vec![];
    let mut events = watcher(api, config).default_backoff().boxed();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(%kind, "watch failed: {e}");
                continue;
            }
        };
        let old = match &event {
            Event::Apply(o) | Event::InitApply(o) => reader.get(&ObjectRef::from_obj(o)),
            Event::Init => {
                before_relist = reader.state();
                None
            }
            _ => None,
        };
        writer.apply_watcher_event(&event);
        match event {
            Event::Apply(o) | Event::InitApply(o) => match old {
                Some(old) => handler.on_update(&wrap((*old).clone()), &wrap(o)),
                None => handler.on_add(&wrap(o)),
            },
            Event::Delete(o) => handler.on_delete(&wrap(o)),
            Event::InitDone => {
                for gone in before_relist.drain(..) {
                    if reader.get(&ObjectRef::from_obj(&*gone)).is_none() {
                        handler.on_delete(&wrap((*gone).clone()));
                    }
                }
            }
            Event::Init => {}
        }
    }
}

/// Informer of the KubeVirt CRs, every change enqueues the CR right away
pub async fn watch_kubevirts(api: Api<KubeVirt>, mut writer: Writer<KubeVirt>, controller: Arc<KubeVirtController>) {
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                writer.apply_watcher_event(&event);
                match &event {
                    Event::Apply(kv) | Event::InitApply(kv) | Event::Delete(kv) => controller.enqueue_kubevirt(kv),
                    Event::Init | Event::InitDone => {}
                }
            }
            Err(e) => warn!("kubevirt watch failed: {e}"),
        }
    }
}
