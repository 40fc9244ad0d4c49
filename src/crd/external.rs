//! Resources owned by other projects (aggregation layer, OpenShift, prometheus-operator).
//!
//! The operator only needs their metadata and an opaque body, so each type keeps every
//! field except `apiVersion`/`kind`/`metadata` in a JSON map.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct ReprRef<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    kind: &'a str,
    metadata: &'a ObjectMeta,
    #[serde(flatten)]
    body: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct Repr {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(flatten)]
    body: BTreeMap<String, Value>,
}

macro_rules! foreign_resource {
    ($(#[$doc:meta])* $name:ident, $group:literal, $version:literal, $kind:literal, $plural:literal, $scope:ty) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, PartialEq)]
        pub struct $name {
            pub metadata: ObjectMeta,
            pub body: BTreeMap<String, Value>,
        }

        impl $name {
            pub fn new(name: &str) -> Self {
                Self {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..ObjectMeta::default()
                    },
                    body: BTreeMap::new(),
                }
            }

            pub fn with_field(mut self, key: &str, value: Value) -> Self {
                self.body.insert(key.to_string(), value);
                self
            }

            pub fn spec(&self) -> Option<&Value> {
                self.body.get("spec")
            }
        }

        impl k8s_openapi::Resource for $name {
            const API_VERSION: &'static str = concat!($group, "/", $version);
            const GROUP: &'static str = $group;
            const KIND: &'static str = $kind;
            const VERSION: &'static str = $version;
            const URL_PATH_SEGMENT: &'static str = $plural;
            type Scope = $scope;
        }

        impl k8s_openapi::Metadata for $name {
            type Ty = ObjectMeta;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                ReprRef {
                    api_version: <$name as k8s_openapi::Resource>::API_VERSION,
                    kind: $kind,
                    metadata: &self.metadata,
                    body: &self.body,
                }
                .serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let mut repr = Repr::deserialize(deserializer)?;
                repr.body.remove("apiVersion");
                repr.body.remove("kind");
                Ok(Self {
                    metadata: repr.metadata,
                    body: repr.body,
                })
            }
        }
    };
}

foreign_resource!(
    /// apiregistration.k8s.io APIService
    ApiService,
    "apiregistration.k8s.io",
    "v1",
    "APIService",
    "apiservices",
    k8s_openapi::ClusterResourceScope
);

foreign_resource!(
    /// OpenShift SecurityContextConstraints, fields live at the top level
    SecurityContextConstraints,
    "security.openshift.io",
    "v1",
    "SecurityContextConstraints",
    "securitycontextconstraints",
    k8s_openapi::ClusterResourceScope
);

foreign_resource!(
    /// OpenShift Route
    Route,
    "route.openshift.io",
    "v1",
    "Route",
    "routes",
    k8s_openapi::NamespaceResourceScope
);

foreign_resource!(
    ServiceMonitor,
    "monitoring.coreos.com",
    "v1",
    "ServiceMonitor",
    "servicemonitors",
    k8s_openapi::NamespaceResourceScope
);

foreign_resource!(
    PrometheusRule,
    "monitoring.coreos.com",
    "v1",
    "PrometheusRule",
    "prometheusrules",
    k8s_openapi::NamespaceResourceScope
);
