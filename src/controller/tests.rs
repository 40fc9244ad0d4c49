use async_trait::async_trait;
use chrono::Utc;
use json_patch::{AddOperation, PatchOperation};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{DeleteParams, Patch};
use kube::core::ErrorResponse;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::*;
use crate::components::admission::TEMPORARY_WEBHOOK_PREFIX;
use crate::components::crds::all_crds;
use crate::components::{KUBEVIRT_EXTERNAL_CA, VIRT_API, VIRT_CONTROLLER, VIRT_HANDLER};
use crate::conditions::{Conditions, REASON_DEPLOYMENT_FAILED_EXISTING};
use crate::config::{DeploymentConfig, KUBEVIRT_VERSION_ENV, OPERATOR_IMAGE_ENV};
use crate::crd::{ConditionType, KUBEVIRT_FINALIZER, KubeVirtPhase, KubeVirtSpec};
use crate::install::{generate_current_install_strategy, new_install_strategy_config_map};
use crate::kinds::{Kind, ManagedObject, ObjectKey, StoreWriters};
use crate::stores::MANAGED_KINDS;

const NAMESPACE: &str = "kubevirt";

#[derive(Debug)]
enum ClusterEvent {
    Added(ManagedObject),
    Modified(ManagedObject, ManagedObject),
    Deleted(ManagedObject),
    KubeVirt(KubeVirt),
    KubeVirtDeleted(KubeVirt),
}

/// Writes issued through the client since the last [`FakeCluster::take_writes`]
#[derive(Debug, Default)]
struct Writes {
    creates: Vec<ObjectKey>,
    patches: Vec<ObjectKey>,
    deletes: Vec<ObjectKey>,
    status_updates: usize,
}

impl Writes {
    fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.patches.is_empty() && self.deletes.is_empty() && self.status_updates == 0
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    kubevirts: BTreeMap<String, KubeVirt>,
    pending: Vec<ClusterEvent>,
    writes: Writes,
    events: Vec<String>,
    kubevirt_history: Vec<KubeVirt>,
    counter: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.counter += 1;
        self.counter.to_string()
    }

    fn insert(&mut self, mut object: ManagedObject) -> ManagedObject {
        let version = self.next_version();
        let meta = object.meta_mut();
        if meta.name.is_none() {
            meta.name = meta.generate_name.as_ref().map(|prefix| format!("{prefix}{version}"));
        }
        meta.uid = Some(format!("uid-{version}"));
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some(version);
        self.objects.insert(object.key(), object.clone());
        self.pending.push(ClusterEvent::Added(object.clone()));
        object
    }

    /// Replaces `old` with `new`. A terminating object that lost its last finalizer is gone.
    fn store(&mut self, old: ManagedObject, mut new: ManagedObject) -> ManagedObject {
        let key = new.key();
        if new.is_terminating() && new.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
            self.objects.remove(&key);
            self.pending.push(ClusterEvent::Deleted(new.clone()));
            return new;
        }
        new.meta_mut().resource_version = Some(self.next_version());
        self.objects.insert(key, new.clone());
        self.pending.push(ClusterEvent::Modified(old, new.clone()));
        new
    }

    /// Applies `change` to the object's JSON, bumping the generation when the content moved
    fn modify(&mut self, key: &ObjectKey, change: impl FnOnce(&mut Value) -> Result<()>) -> Result<ManagedObject> {
        let old = self.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        let before = old.to_value()?;
        let mut after = before.clone();
        change(&mut after)?;
        let mut new = ManagedObject::from_value(key.kind, after.clone())?;
        if content(&before) != content(&after) {
            new.meta_mut().generation = Some(old.generation() + 1);
        }
        Ok(self.store(old, new))
    }

    fn kubevirt(&self, namespace: &str, name: &str) -> Result<KubeVirt> {
        self.kubevirts
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("kubevirt {name} not found")))
    }

    fn store_kubevirt(&mut self, mut kv: KubeVirt) -> KubeVirt {
        let key = KubeVirtController::kv_key(&kv);
        let gone = kv.metadata.deletion_timestamp.is_some() && kv.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if gone {
            self.kubevirt_history.push(kv.clone());
            self.kubevirts.remove(&key);
            self.pending.push(ClusterEvent::KubeVirtDeleted(kv.clone()));
            return kv;
        }
        kv.metadata.resource_version = Some(self.next_version());
        self.kubevirt_history.push(kv.clone());
        self.kubevirts.insert(key, kv.clone());
        self.pending.push(ClusterEvent::KubeVirt(kv.clone()));
        kv
    }
}

fn content(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(fields) = value.as_object_mut() {
        fields.remove("metadata");
        fields.remove("status");
    }
    value
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn not_found(key: &ObjectKey) -> Error {
    api_error(404, "NotFound", format!("{key} not found"))
}

/// JSON patches as the API server applies them, a replace of a missing field adds it
fn apply_patch(doc: &mut Value, patch: &Patch<Value>) -> Result<()> {
    match patch {
        Patch::Json(p) => {
            let ops: Vec<PatchOperation> = p
                .0
                .iter()
                .cloned()
                .map(|op| match op {
                    PatchOperation::Replace(r) if doc.pointer(r.path.as_str()).is_none() => {
                        PatchOperation::Add(AddOperation {
                            path: r.path,
                            value: r.value,
                        })
                    }
                    op => op,
                })
                .collect();
            json_patch::patch(doc, &ops).map_err(Error::PatchError)
        }
        Patch::Merge(value) => {
            json_patch::merge(doc, value);
            Ok(())
        }
        _ => Err(Error::OtherError("unsupported patch type".into())),
    }
}

/// In-memory API server. Every write is recorded and queued as a watch event.
#[derive(Default)]
struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    fn seed(&self, object: ManagedObject) -> ManagedObject {
        self.state.lock().insert(object)
    }

    fn add_kubevirt(&self, mut kv: KubeVirt) {
        let mut state = self.state.lock();
        let version = state.next_version();
        kv.metadata.uid = Some(format!("uid-{version}"));
        kv.metadata.generation = Some(1);
        kv.metadata.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        state.store_kubevirt(kv);
    }

    fn kubevirt(&self, name: &str) -> Option<KubeVirt> {
        self.state.lock().kubevirt(NAMESPACE, name).ok()
    }

    /// A spec change made by the user, bumping the generation
    fn edit_kubevirt(&self, name: &str, edit: impl FnOnce(&mut KubeVirt)) {
        let mut state = self.state.lock();
        let mut kv = state.kubevirt(NAMESPACE, name).unwrap();
        edit(&mut kv);
        kv.metadata.generation = Some(kv.metadata.generation.unwrap_or_default() + 1);
        state.store_kubevirt(kv);
    }

    fn mark_kubevirt_deleted(&self, name: &str) {
        let mut state = self.state.lock();
        let mut kv = state.kubevirt(NAMESPACE, name).unwrap();
        kv.metadata.deletion_timestamp = Some(Time(Utc::now()));
        state.store_kubevirt(kv);
    }

    /// Forgets every generation the operator recorded, as if the status was lost
    fn forget_generations(&self, name: &str) {
        let mut state = self.state.lock();
        let mut kv = state.kubevirt(NAMESPACE, name).unwrap();
        for record in kv.status_mut().generations.iter_mut().flatten() {
            record.last_generation = -1;
        }
        state.store_kubevirt(kv);
    }

    /// Every version of every CR stored so far, oldest first
    fn kubevirt_history(&self) -> Vec<KubeVirt> {
        self.state.lock().kubevirt_history.clone()
    }

    fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.state.lock().objects.get(key).cloned()
    }

    fn objects_of(&self, kind: Kind) -> Vec<ManagedObject> {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .cloned()
            .collect()
    }

    /// A change made behind the operator's back
    fn tamper(&self, key: &ObjectKey, change: impl FnOnce(&mut Value)) {
        self.state
            .lock()
            .modify(key, |v| {
                change(v);
                Ok(())
            })
            .unwrap();
    }

    /// Marks every workload ready and runs one pod per workload built from its template
    fn converge(&self) {
        let workloads: Vec<ObjectKey> = self
            .state
            .lock()
            .objects
            .keys()
            .filter(|k| matches!(k.kind, Kind::Deployment | Kind::DaemonSet))
            .cloned()
            .collect();
        for key in workloads {
            let status = match key.kind {
                Kind::Deployment => json!({ "replicas": 1, "readyReplicas": 1 }),
                _ => json!({
                    "currentNumberScheduled": 1,
                    "desiredNumberScheduled": 1,
                    "numberMisscheduled": 0,
                    "numberReady": 1,
                }),
            };
            self.tamper(&key, |v| v["status"] = status);

            let workload = self.object(&key).unwrap().to_value().unwrap();
            let template = &workload["spec"]["template"]["metadata"];
            let pod: Pod = serde_json::from_value(json!({
                "metadata": {
                    "name": format!("{}-pod", key.name),
                    "namespace": key.namespace,
                    "labels": template["labels"],
                    "annotations": template["annotations"],
                },
                "status": {
                    "phase": "Running",
                    "containerStatuses": [{
                        "name": key.name,
                        "ready": true,
                        "restartCount": 0,
                        "image": "",
                        "imageID": "",
                    }],
                },
            }))
            .unwrap();
            let pod = ManagedObject::Pod(pod);
            let pod_key = pod.key();
            let mut state = self.state.lock();
            match state.objects.get(&pod_key).cloned() {
                Some(old) => {
                    state.store(old, pod);
                }
                None => {
                    state.insert(pod);
                }
            }
        }
    }

    fn take_writes(&self) -> Writes {
        std::mem::take(&mut self.state.lock().writes)
    }

    fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    fn drain(&self) -> Vec<ClusterEvent> {
        std::mem::take(&mut self.state.lock().pending)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let mut state = self.state.lock();
        let key = object.key();
        if !key.name.is_empty() && state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{key} already exists")));
        }
        let created = state.insert(object.clone());
        state.writes.creates.push(created.key());
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Patch<Value>) -> Result<ManagedObject> {
        let mut state = self.state.lock();
        let patched = state.modify(key, |doc| apply_patch(doc, patch))?;
        state.writes.patches.push(key.clone());
        Ok(patched)
    }

    async fn delete(&self, key: &ObjectKey, _params: &DeleteParams) -> Result<()> {
        let mut state = self.state.lock();
        let old = state.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        state.writes.deletes.push(key.clone());
        if old.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
            state.objects.remove(key);
            state.pending.push(ClusterEvent::Deleted(old));
            return Ok(());
        }
        if old.is_terminating() {
            return Ok(());
        }
        let kind = key.kind;
        state.modify(key, |doc| {
            doc["metadata"]["deletionTimestamp"] = serde_json::to_value(Time(Utc::now()))?;
            if kind == Kind::Crd {
                let names = doc["spec"]["names"].clone();
                doc["status"] = json!({
                    "acceptedNames": names,
                    "conditions": [{
                        "type": "Terminating",
                        "status": "False",
                        "reason": "InstanceDeletionCompleted",
                    }],
                });
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        Ok(self.state.lock().objects.get(key).cloned())
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        Ok(config_map.clone())
    }

    async fn update_kubevirt(&self, kv: &KubeVirt) -> Result<KubeVirt> {
        Ok(self.state.lock().store_kubevirt(kv.clone()))
    }

    async fn update_kubevirt_status(&self, kv: &KubeVirt) -> Result<KubeVirt> {
        let mut state = self.state.lock();
        let namespace = kv.metadata.namespace.as_deref().unwrap_or_default();
        let mut stored = state.kubevirt(namespace, kv.metadata.name.as_deref().unwrap_or_default())?;
        stored.status = kv.status.clone();
        state.writes.status_updates += 1;
        Ok(state.store_kubevirt(stored))
    }

    async fn patch_kubevirt(&self, namespace: &str, name: &str, patch: &Patch<Value>) -> Result<KubeVirt> {
        let mut state = self.state.lock();
        let mut doc = serde_json::to_value(state.kubevirt(namespace, name)?)?;
        apply_patch(&mut doc, patch)?;
        Ok(state.store_kubevirt(serde_json::from_value(doc)?))
    }

    async fn publish_event(&self, _kv: &KubeVirt, _warning: bool, reason: &str, _action: &str, _note: String) {
        self.state.lock().events.push(reason.to_string());
    }
}

fn test_env() -> Env {
    [
        (OPERATOR_IMAGE_ENV, "quay.io/kubevirt/virt-operator:v1.2.0"),
        (KUBEVIRT_VERSION_ENV, "v1.2.0"),
    ]
    .into_iter()
    .collect()
}

/// A CR that already carries the api version annotations
fn kubevirt(name: &str) -> KubeVirt {
    let mut kv = KubeVirt::new(name, KubeVirtSpec::default());
    kv.metadata.namespace = Some(NAMESPACE.into());
    kv.metadata.annotations = Some(BTreeMap::from([
        (LATEST_OBSERVED_API_VERSION_ANNOTATION.to_string(), KUBEVIRT_API_VERSION.to_string()),
        (STORAGE_OBSERVED_API_VERSION_ANNOTATION.to_string(), KUBEVIRT_API_VERSION.to_string()),
    ]));
    kv
}

fn key(kind: Kind, name: &str) -> ObjectKey {
    let namespace = kind.namespaced().then_some(NAMESPACE);
    ObjectKey::new(kind, namespace, name)
}

fn condition(kv: &KubeVirt, type_: ConditionType) -> Option<(String, Option<String>)> {
    kv.condition(type_).map(|c| (c.status.clone(), c.reason.clone()))
}

/// Controller wired to a [`FakeCluster`], with the watch events pumped by hand
struct Harness {
    cluster: Arc<FakeCluster>,
    controller: Arc<KubeVirtController>,
    writers: StoreWriters,
    kubevirts: Writer<KubeVirt>,
    env: Env,
}

impl Harness {
    fn new() -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let writers = StoreWriters::default();
        let kubevirts = Writer::<KubeVirt>::default();
        let env = test_env();
        let controller = Arc::new(KubeVirtController::new(
            cluster.clone(),
            kubevirts.as_reader(),
            writers.as_stores(),
            env.clone(),
            NAMESPACE.to_string(),
            Arc::new(StrategyCache::new()),
        ));
        cluster.seed(ManagedObject::Namespace(Namespace {
            metadata: ObjectMeta {
                name: Some(NAMESPACE.into()),
                ..Default::default()
            },
            ..Default::default()
        }));
        let mut harness = Self {
            cluster,
            controller,
            writers,
            kubevirts,
            env,
        };
        harness.deliver();
        harness
    }

    fn deliver(&mut self) {
        for event in self.cluster.drain() {
            match event {
                ClusterEvent::Added(o) => {
                    self.writers.apply(&o);
                    self.controller.on_add(&o);
                }
                ClusterEvent::Modified(old, new) => {
                    self.writers.apply(&new);
                    self.controller.on_update(&old, &new);
                }
                ClusterEvent::Deleted(o) => {
                    self.writers.remove(&o);
                    self.controller.on_delete(&o);
                }
                ClusterEvent::KubeVirt(kv) => {
                    self.kubevirts.apply_watcher_event(&Event::Apply(kv.clone()));
                    self.controller.enqueue_kubevirt(&kv);
                }
                ClusterEvent::KubeVirtDeleted(kv) => self.kubevirts.apply_watcher_event(&Event::Delete(kv)),
            }
        }
    }

    fn add_kubevirt(&mut self, kv: KubeVirt) {
        self.cluster.add_kubevirt(kv);
        self.deliver();
    }

    /// Stores the strategy a dump job would produce for `kv`
    fn seed_strategy(&mut self, kv: &KubeVirt) {
        let config = DeploymentConfig::target_from_kv(kv, &self.env);
        let strategy = generate_current_install_strategy(&config, None, None, NAMESPACE).unwrap();
        let config_map = new_install_strategy_config_map(&config, &strategy).unwrap();
        self.cluster.seed(ManagedObject::InstallStrategyConfigMap(config_map));
        self.deliver();
    }

    async fn execute(&mut self, name: &str) -> Result<()> {
        self.deliver();
        let result = self.controller.execute(&format!("{NAMESPACE}/{name}")).await;
        self.deliver();
        result
    }

    fn converge(&mut self) {
        self.cluster.converge();
        self.deliver();
    }

    fn kv(&self, name: &str) -> KubeVirt {
        self.cluster.kubevirt(name).unwrap()
    }

    /// Alternates passes and workload convergence until `done` holds for the CR
    async fn run_until(&mut self, name: &str, done: impl Fn(&KubeVirt) -> bool) {
        for _ in 0..10 {
            self.execute(name).await.unwrap();
            if done(&self.kv(name)) {
                return;
            }
            self.converge();
        }
        panic!("{name} did not converge: {:?}", self.kv(name).status);
    }

    async fn install(&mut self, name: &str) {
        let kv = kubevirt(name);
        self.seed_strategy(&kv);
        self.add_kubevirt(kv);
        self.run_until(name, |kv| kv.status_ref().phase == Some(KubeVirtPhase::Deployed))
            .await;
    }
}

#[tokio::test]
async fn missing_api_version_annotations_are_stamped_first() {
    let mut h = Harness::new();
    let mut kv = kubevirt("kubevirt");
    kv.metadata.annotations = None;
    h.add_kubevirt(kv);

    h.execute("kubevirt").await.unwrap();

    let annotations = h.kv("kubevirt").metadata.annotations.unwrap();
    assert_eq!(
        annotations.get(LATEST_OBSERVED_API_VERSION_ANNOTATION).map(String::as_str),
        Some(KUBEVIRT_API_VERSION)
    );
    assert!(annotations.contains_key(STORAGE_OBSERVED_API_VERSION_ANNOTATION));
    assert!(h.cluster.take_writes().creates.is_empty());
}

#[tokio::test]
async fn missing_strategy_starts_a_dump_job_once() {
    let mut h = Harness::new();
    h.add_kubevirt(kubevirt("kubevirt"));

    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    assert_eq!(writes.creates.len(), 1);
    assert_eq!(writes.creates[0].kind, Kind::InstallStrategyJob);

    let kv = h.kv("kubevirt");
    assert_eq!(kv.status_ref().phase, Some(KubeVirtPhase::Deploying));
    assert_eq!(kv.status_ref().operator_version.as_deref(), Some("v1.2.0"));
    assert!(h.cluster.events().contains(&"DeploymentStarted".to_string()));

    h.execute("kubevirt").await.unwrap();
    assert!(h.cluster.take_writes().creates.is_empty(), "job is still running");
}

#[tokio::test]
async fn fresh_install_rolls_out_api_before_controllers() {
    let mut h = Harness::new();
    let kv = kubevirt("kubevirt");
    h.seed_strategy(&kv);
    h.add_kubevirt(kv);

    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    let created = |kind: Kind| writes.creates.iter().filter(|k| k.kind == kind).count();
    assert_eq!(created(Kind::Crd), all_crds().len());
    assert!(writes.creates.contains(&key(Kind::Deployment, VIRT_API)));
    assert!(!writes.creates.contains(&key(Kind::Deployment, VIRT_CONTROLLER)));
    assert_eq!(created(Kind::DaemonSet), 0);
    assert!(writes.creates.contains(&key(Kind::ConfigMap, KUBEVIRT_EXTERNAL_CA)));
    assert!(writes
        .creates
        .iter()
        .any(|k| k.kind == Kind::ValidatingWebhook && k.name.starts_with(TEMPORARY_WEBHOOK_PREFIX)));

    let kv = h.kv("kubevirt");
    assert_eq!(kv.metadata.finalizers, Some(vec![KUBEVIRT_FINALIZER.to_string()]));
    assert_eq!(kv.status_ref().phase, Some(KubeVirtPhase::Deploying));
    assert_eq!(condition(&kv, ConditionType::Created), None);

    h.converge();
    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    assert!(writes.creates.contains(&key(Kind::Deployment, VIRT_CONTROLLER)));
    assert!(writes.creates.contains(&key(Kind::DaemonSet, VIRT_HANDLER)));
    assert!(writes
        .deletes
        .iter()
        .any(|k| k.kind == Kind::ValidatingWebhook && k.name.starts_with(TEMPORARY_WEBHOOK_PREFIX)));

    h.run_until("kubevirt", |kv| kv.status_ref().phase == Some(KubeVirtPhase::Deployed))
        .await;
    let kv = h.kv("kubevirt");
    let status = kv.status_ref();
    assert_eq!(status.observed_kube_virt_version.as_deref(), Some("v1.2.0"));
    assert_eq!(status.observed_deployment_id, status.target_deployment_id);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(
        condition(&kv, ConditionType::Available),
        Some(("True".to_string(), Some("AllComponentsReady".to_string())))
    );
    assert_eq!(condition(&kv, ConditionType::Created).map(|c| c.0).as_deref(), Some("True"));
    assert!(h.cluster.events().contains(&"Deployed".to_string()));

    let namespace = h.cluster.object(&key(Kind::Namespace, NAMESPACE)).unwrap();
    assert_eq!(
        namespace.labels().get("openshift.io/cluster-monitoring").map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn converged_install_is_left_alone() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    h.cluster.take_writes();

    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    assert!(writes.is_empty(), "unexpected writes {writes:?}");
}

#[tokio::test]
async fn second_cr_is_refused_without_side_effects() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    h.add_kubevirt(kubevirt("another"));
    h.cluster.take_writes();

    h.execute("another").await.unwrap();

    let writes = h.cluster.take_writes();
    assert!(writes.creates.is_empty() && writes.patches.is_empty() && writes.deletes.is_empty());
    let refused = h.kv("another");
    assert_eq!(
        condition(&refused, ConditionType::Synchronized),
        Some(("False".to_string(), Some(REASON_DEPLOYMENT_FAILED_EXISTING.to_string())))
    );
    assert_eq!(refused.status_ref().phase, None);
    assert_eq!(refused.metadata.finalizers, None);
    assert_eq!(h.kv("kubevirt").status_ref().phase, Some(KubeVirtPhase::Deployed));
}

#[tokio::test]
async fn drifted_deployment_is_restored() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    let api = key(Kind::Deployment, VIRT_API);
    h.cluster.tamper(&api, |v| v["spec"]["replicas"] = json!(5));
    h.deliver();
    h.cluster.take_writes();

    h.execute("kubevirt").await.unwrap();

    assert!(h.cluster.take_writes().patches.contains(&api));
    let restored = h.cluster.object(&api).unwrap().to_value().unwrap();
    assert_eq!(restored["spec"]["replicas"], json!(2));

    h.execute("kubevirt").await.unwrap();
    assert!(!h.cluster.take_writes().patches.contains(&api), "generation is recorded");
}

#[tokio::test]
async fn update_rolls_handlers_before_controllers_and_api() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    h.cluster.edit_kubevirt("kubevirt", |kv| kv.spec.image_tag = Some("v1.3.0".into()));
    let edited = h.kv("kubevirt");
    h.seed_strategy(&edited);
    h.cluster.take_writes();

    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    assert!(writes.patches.contains(&key(Kind::DaemonSet, VIRT_HANDLER)));
    assert!(
        !writes
            .patches
            .iter()
            .any(|k| matches!(k.kind, Kind::Deployment | Kind::PodDisruptionBudget | Kind::Namespace)),
        "deployments wait for the handlers: {:?}",
        writes.patches
    );
    let kv = h.kv("kubevirt");
    assert!(kv.is_updating());
    assert_eq!(
        condition(&kv, ConditionType::Progressing).and_then(|c| c.1).as_deref(),
        Some("UpdateInProgress")
    );

    h.run_until("kubevirt", |kv| {
        kv.status_ref().observed_kube_virt_version.as_deref() == Some("v1.3.0")
            && condition(kv, ConditionType::Progressing).map(|c| c.0).as_deref() == Some("False")
    })
    .await;
    assert_eq!(h.kv("kubevirt").status_ref().observed_generation, Some(2));
}

#[tokio::test]
async fn deletion_removes_crds_first_and_then_everything_else() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    h.cluster.take_writes();
    let installed = h.controller.stores.managed_object_count()
        + h.cluster.objects_of(Kind::InstallStrategyConfigMap).len();
    h.cluster.mark_kubevirt_deleted("kubevirt");
    h.deliver();

    let mut passes = 0;
    while h.cluster.kubevirt("kubevirt").is_some() {
        assert!(passes < 10, "deletion did not finish");
        h.execute("kubevirt").await.unwrap();
        passes += 1;
    }

    let deletes = h.cluster.take_writes().deletes;
    assert_eq!(deletes.len(), installed, "every installed object is deleted once: {deletes:?}");
    let first_non_crd = deletes.iter().position(|k| k.kind != Kind::Crd).unwrap();
    assert!(deletes[first_non_crd..].iter().all(|k| k.kind != Kind::Crd));
    for kind in MANAGED_KINDS {
        let left: Vec<_> = h
            .cluster
            .objects_of(*kind)
            .into_iter()
            .filter(|o| *kind != Kind::Scc || o.is_managed_by_operator())
            .collect();
        assert!(left.is_empty(), "{kind} left behind: {left:?}");
    }
    assert!(h.cluster.objects_of(Kind::InstallStrategyConfigMap).is_empty());
    assert!(h.cluster.events().contains(&"DeletionStarted".to_string()));

    let history = h.cluster.kubevirt_history();
    let deleted = history
        .iter()
        .position(|kv| kv.status_ref().phase == Some(KubeVirtPhase::Deleted))
        .unwrap();
    let released = history
        .iter()
        .position(|kv| kv.metadata.deletion_timestamp.is_some() && kv.metadata.finalizers.as_ref().is_none_or(Vec::is_empty))
        .unwrap();
    assert!(deleted < released, "phase Deleted is stored before the finalizer goes");
    assert_eq!(history[deleted].metadata.finalizers, Some(vec![KUBEVIRT_FINALIZER.to_string()]));
}

#[tokio::test]
async fn lost_generation_records_patch_each_object_once() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    let records = h.kv("kubevirt").status_ref().generations.clone().unwrap_or_default();
    assert!(!records.is_empty());
    h.cluster.forget_generations("kubevirt");
    h.deliver();
    h.cluster.take_writes();

    h.execute("kubevirt").await.unwrap();
    let patches = h.cluster.take_writes().patches;
    for record in &records {
        let count = patches
            .iter()
            .filter(|k| {
                k.kind.resource() == record.resource
                    && k.name == record.name
                    && k.namespace.as_deref() == record.namespace.as_deref()
            })
            .count();
        assert_eq!(count, 1, "{}/{} patched {count} times", record.resource, record.name);
    }
    assert_eq!(patches.len(), records.len(), "only recorded objects are patched: {patches:?}");
    assert!(h.kv("kubevirt")
        .status_ref()
        .generations
        .iter()
        .flatten()
        .all(|r| r.last_generation > 0));

    h.execute("kubevirt").await.unwrap();
    let patches = h.cluster.take_writes().patches;
    assert!(patches.is_empty(), "recorded generations skip the patch: {patches:?}");
}

#[tokio::test]
async fn two_crs_created_together_are_both_refused() {
    let mut h = Harness::new();
    let created = Time(Utc::now());
    let (mut first, mut second) = (kubevirt("first"), kubevirt("second"));
    first.metadata.creation_timestamp = Some(created.clone());
    second.metadata.creation_timestamp = Some(created);
    h.seed_strategy(&first);
    h.add_kubevirt(first);
    h.add_kubevirt(second);
    h.cluster.take_writes();

    for name in ["first", "second"] {
        h.execute(name).await.unwrap();
        let writes = h.cluster.take_writes();
        assert!(
            writes.creates.is_empty() && writes.patches.is_empty() && writes.deletes.is_empty(),
            "{name} wrote {writes:?}"
        );
        let kv = h.kv(name);
        assert_eq!(
            condition(&kv, ConditionType::Synchronized),
            Some(("False".to_string(), Some(REASON_DEPLOYMENT_FAILED_EXISTING.to_string())))
        );
        assert_eq!(kv.status_ref().phase, None);
        assert_eq!(kv.metadata.finalizers, None);
    }
    assert!(h.cluster.objects_of(Kind::InstallStrategyJob).is_empty());
}

#[tokio::test]
async fn service_defaults_are_not_drift() {
    let mut h = Harness::new();
    h.install("kubevirt").await;
    let api = key(Kind::Service, VIRT_API);
    h.cluster.tamper(&api, |v| {
        let spec = &mut v["spec"];
        spec["clusterIP"] = json!("10.96.0.10");
        spec["clusterIPs"] = json!(["10.96.0.10"]);
        spec["internalTrafficPolicy"] = json!("Cluster");
        spec["ipFamilies"] = json!(["IPv4"]);
        spec["ipFamilyPolicy"] = json!("SingleStack");
        spec["sessionAffinity"] = json!("None");
    });
    h.deliver();
    h.cluster.take_writes();

    h.execute("kubevirt").await.unwrap();
    h.execute("kubevirt").await.unwrap();
    let writes = h.cluster.take_writes();
    assert!(!writes.patches.contains(&api), "defaulted fields were patched: {writes:?}");
    assert!(writes.deletes.is_empty());

    h.cluster.tamper(&api, |v| v["spec"]["ports"][0]["port"] = json!(1));
    h.deliver();
    h.execute("kubevirt").await.unwrap();
    assert!(h.cluster.take_writes().patches.contains(&api));
    let restored = h.cluster.object(&api).unwrap().to_value().unwrap();
    assert_ne!(restored["spec"]["ports"][0]["port"], json!(1));
    assert_eq!(restored["spec"]["clusterIP"], json!("10.96.0.10"));
}

#[tokio::test]
async fn events_settle_expectations() {
    let mut h = Harness::new();
    h.add_kubevirt(kubevirt("kubevirt"));
    let kv_key = format!("{NAMESPACE}/kubevirt");
    let crd = ManagedObject::Crd(all_crds().remove(0));

    h.controller.expectations.raise_expectations(Kind::Crd, &kv_key, 1, 0);
    assert!(!h.controller.expectations.all_satisfied(&kv_key));
    h.controller.on_add(&crd);
    assert!(h.controller.expectations.all_satisfied(&kv_key));

    let crd_key = crd.key().cache_key();
    h.controller.expectations.add_expected_deletion(Kind::Crd, &kv_key, &crd_key);
    let mut terminating = crd.clone();
    terminating.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
    h.controller.on_add(&terminating);
    assert!(h.controller.expectations.all_satisfied(&kv_key), "terminating objects count as deleted");

    h.controller.expectations.raise_expectations(Kind::Pod, &kv_key, 1, 0);
    h.controller.on_add(&ManagedObject::Pod(Pod::default()));
    assert!(!h.controller.expectations.satisfied(Kind::Pod, &kv_key), "pods are not counted");
}
