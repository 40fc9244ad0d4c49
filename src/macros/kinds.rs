/// Generates the closed set of kinds the operator manages from a single table.
///
/// Each row produces a `Kind` variant, a `ManagedObject` variant wrapping the typed
/// object, a reflector store in `Stores`, its writer in `StoreWriters`, and the typed
/// `Api` dispatch used by the live client.
#[macro_export]
macro_rules! managed_kinds {
    (@api namespaced, $ty:ty, $client:expr, $ns:expr) => {
        match $ns {
            Some(ns) => kube::Api::<$ty>::namespaced($client, ns),
            None => kube::Api::<$ty>::all($client),
        }
    };
    (@api cluster, $ty:ty, $client:expr, $ns:expr) => {{
        let _ = $ns;
        kube::Api::<$ty>::all($client)
    }};
    (@namespaced namespaced) => { true };
    (@namespaced cluster) => { false };
    (
        $(
            $variant:ident($ty:ty) => $field:ident, $scope:ident, selector: $selector:expr;
        )+
    ) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Kind {
            $($variant),+
        }

        impl Kind {
            pub const ALL: &'static [Kind] = &[$(Kind::$variant),+];

            /// Table name of the kind, distinct even when two rows share a Kubernetes type
            pub fn name(self) -> &'static str {
                match self {
                    $(Kind::$variant => stringify!($variant)),+
                }
            }

            /// Kubernetes `kind` of the underlying type
            pub fn api_kind(self) -> &'static str {
                match self {
                    $(Kind::$variant => <$ty as k8s_openapi::Resource>::KIND),+
                }
            }

            pub fn group(self) -> &'static str {
                match self {
                    $(Kind::$variant => <$ty as k8s_openapi::Resource>::GROUP),+
                }
            }

            pub fn api_version(self) -> &'static str {
                match self {
                    $(Kind::$variant => <$ty as k8s_openapi::Resource>::API_VERSION),+
                }
            }

            /// Plural resource name, used in generation records
            pub fn resource(self) -> &'static str {
                match self {
                    $(Kind::$variant => <$ty as k8s_openapi::Resource>::URL_PATH_SEGMENT),+
                }
            }

            pub fn namespaced(self) -> bool {
                match self {
                    $(Kind::$variant => $crate::managed_kinds!(@namespaced $scope)),+
                }
            }

            /// Label selector used by the informer of this kind
            pub fn label_selector(self) -> &'static str {
                match self {
                    $(Kind::$variant => $selector),+
                }
            }

            pub(crate) async fn patch_in(
                self,
                client: kube::Client,
                namespace: Option<&str>,
                name: &str,
                patch: &kube::api::Patch<serde_json::Value>,
            ) -> kube::Result<ManagedObject> {
                let pp = kube::api::PatchParams::default();
                match self {
                    $(Kind::$variant => {
                        let api = $crate::managed_kinds!(@api $scope, $ty, client, namespace);
                        api.patch(name, &pp, patch).await.map(ManagedObject::$variant)
                    }),+
                }
            }

            pub(crate) async fn delete_in(
                self,
                client: kube::Client,
                namespace: Option<&str>,
                name: &str,
                params: &kube::api::DeleteParams,
            ) -> kube::Result<()> {
                match self {
                    $(Kind::$variant => {
                        let api = $crate::managed_kinds!(@api $scope, $ty, client, namespace);
                        api.delete(name, params).await.map(|_| ())
                    }),+
                }
            }

            pub(crate) async fn get_in(
                self,
                client: kube::Client,
                namespace: Option<&str>,
                name: &str,
            ) -> kube::Result<Option<ManagedObject>> {
                match self {
                    $(Kind::$variant => {
                        let api = $crate::managed_kinds!(@api $scope, $ty, client, namespace);
                        api.get_opt(name).await.map(|o| o.map(ManagedObject::$variant))
                    }),+
                }
            }
        }

        /// A live or desired object of one of the managed kinds
        #[derive(Clone, Debug, PartialEq)]
        pub enum ManagedObject {
            $($variant($ty)),+
        }

        impl ManagedObject {
            pub fn kind(&self) -> Kind {
                match self {
                    $(ManagedObject::$variant(_) => Kind::$variant),+
                }
            }

            pub fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                match self {
                    $(ManagedObject::$variant(o) => kube::Resource::meta(o)),+
                }
            }

            pub fn meta_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                match self {
                    $(ManagedObject::$variant(o) => kube::Resource::meta_mut(o)),+
                }
            }

            pub fn to_value(&self) -> $crate::Result<serde_json::Value> {
                match self {
                    $(ManagedObject::$variant(o) => serde_json::to_value(o).map_err($crate::Error::SerializationError)),+
                }
            }

            pub fn from_value(kind: Kind, value: serde_json::Value) -> $crate::Result<Self> {
                match kind {
                    $(Kind::$variant => serde_json::from_value::<$ty>(value)
                        .map(ManagedObject::$variant)
                        .map_err($crate::Error::SerializationError)),+
                }
            }

            pub(crate) async fn create_in(&self, client: kube::Client) -> kube::Result<ManagedObject> {
                let pp = kube::api::PostParams::default();
                match self {
                    $(ManagedObject::$variant(o) => {
                        let ns = kube::Resource::meta(o).namespace.clone();
                        let api = $crate::managed_kinds!(@api $scope, $ty, client, ns.as_deref());
                        api.create(&pp, o).await.map(ManagedObject::$variant)
                    }),+
                }
            }
        }

        /// Read side of every informer cache
        #[derive(Clone)]
        pub struct Stores {
            $(pub $field: kube::runtime::reflector::Store<$ty>),+
        }

        impl Stores {
            pub fn list(&self, kind: Kind) -> Vec<ManagedObject> {
                match kind {
                    $(Kind::$variant => self
                        .$field
                        .state()
                        .into_iter()
                        .map(|o| ManagedObject::$variant((*o).clone()))
                        .collect()),+
                }
            }

            pub fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Option<ManagedObject> {
                match kind {
                    $(Kind::$variant => {
                        let mut oref = kube::runtime::reflector::ObjectRef::<$ty>::new(name);
                        if let Some(ns) = namespace {
                            oref = oref.within(ns);
                        }
                        self.$field.get(&oref).map(|o| ManagedObject::$variant((*o).clone()))
                    }),+
                }
            }

            pub fn len(&self, kind: Kind) -> usize {
                match kind {
                    $(Kind::$variant => self.$field.state().len()),+
                }
            }

            /// Resolves once every cache has completed its initial list
            pub async fn wait_until_ready(&self) -> $crate::Result<()> {
                $(
                    self.$field
                        .wait_until_ready()
                        .await
                        .map_err(|e| $crate::Error::OtherError(format!("{} cache: {e}", stringify!($variant))))?;
                )+
                Ok(())
            }
        }

        /// Write side of every informer cache, owned by the informers
        pub struct StoreWriters {
            $(pub $field: kube::runtime::reflector::store::Writer<$ty>),+
        }

        impl Default for StoreWriters {
            fn default() -> Self {
                Self {
                    $($field: Default::default()),+
                }
            }
        }

        impl StoreWriters {
            pub fn as_stores(&self) -> Stores {
                Stores {
                    $($field: self.$field.as_reader()),+
                }
            }

            /// Inserts or replaces the object in its cache
            pub fn apply(&mut self, object: &ManagedObject) {
                match object {
                    $(ManagedObject::$variant(o) => self
                        .$field
                        .apply_watcher_event(&kube::runtime::watcher::Event::Apply(o.clone()))),+
                }
            }

            pub fn remove(&mut self, object: &ManagedObject) {
                match object {
                    $(ManagedObject::$variant(o) => self
                        .$field
                        .apply_watcher_event(&kube::runtime::watcher::Event::Delete(o.clone()))),+
                }
            }

            /// One watch loop per kind, each feeding its cache and then `handler`
            pub fn into_informers(
                self,
                client: kube::Client,
                namespace: &str,
                handler: std::sync::Arc<dyn $crate::controller::ObjectEventHandler>,
            ) -> Vec<futures::future::BoxFuture<'static, ()>> {
                let StoreWriters { $($field),+ } = self;
                vec![$(
                    Box::pin($crate::controller::informer::watch(
                        $crate::managed_kinds!(@api $scope, $ty, client.clone(), Kind::$variant.watch_namespace(namespace)),
                        Kind::$variant,
                        $field,
                        ManagedObject::$variant,
                        handler.clone(),
                    ))
                ),+]
            }
        }
    };
}
