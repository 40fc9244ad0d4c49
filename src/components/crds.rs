use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceSubresourceStatus, CustomResourceSubresources,
    CustomResourceValidation, JSONSchemaProps,
};
use serde_json::json;

use super::object_meta;
use crate::kinds::APP_COMPONENT;

struct CrdDef {
    group: &'static str,
    kind: &'static str,
    plural: &'static str,
    singular: &'static str,
    short_names: &'static [&'static str],
}

const CRDS: &[CrdDef] = &[
    CrdDef {
        group: "kubevirt.io",
        kind: "VirtualMachineInstance",
        plural: "virtualmachineinstances",
        singular: "virtualmachineinstance",
        short_names: &["vmi", "vmis"],
    },
    CrdDef {
        group: "kubevirt.io",
        kind: "VirtualMachine",
        plural: "virtualmachines",
        singular: "virtualmachine",
        short_names: &["vm", "vms"],
    },
    CrdDef {
        group: "kubevirt.io",
        kind: "VirtualMachineInstanceReplicaSet",
        plural: "virtualmachineinstancereplicasets",
        singular: "virtualmachineinstancereplicaset",
        short_names: &["vmirs", "vmirss"],
    },
    CrdDef {
        group: "kubevirt.io",
        kind: "VirtualMachineInstancePreset",
        plural: "virtualmachineinstancepresets",
        singular: "virtualmachineinstancepreset",
        short_names: &["vmipreset", "vmipresets"],
    },
    CrdDef {
        group: "kubevirt.io",
        kind: "VirtualMachineInstanceMigration",
        plural: "virtualmachineinstancemigrations",
        singular: "virtualmachineinstancemigration",
        short_names: &["vmim", "vmims"],
    },
    CrdDef {
        group: "snapshot.kubevirt.io",
        kind: "VirtualMachineSnapshot",
        plural: "virtualmachinesnapshots",
        singular: "virtualmachinesnapshot",
        short_names: &["vmsnapshot", "vmsnapshots"],
    },
    CrdDef {
        group: "snapshot.kubevirt.io",
        kind: "VirtualMachineSnapshotContent",
        plural: "virtualmachinesnapshotcontents",
        singular: "virtualmachinesnapshotcontent",
        short_names: &["vmsnapshotcontent", "vmsnapshotcontents"],
    },
    CrdDef {
        group: "snapshot.kubevirt.io",
        kind: "VirtualMachineRestore",
        plural: "virtualmachinerestores",
        singular: "virtualmachinerestore",
        short_names: &["vmrestore", "vmrestores"],
    },
    CrdDef {
        group: "export.kubevirt.io",
        kind: "VirtualMachineExport",
        plural: "virtualmachineexports",
        singular: "virtualmachineexport",
        short_names: &["vmexport", "vmexports"],
    },
];

fn new_crd(def: &CrdDef) -> CustomResourceDefinition {
    let name = format!("{}.{}", def.plural, def.group);
    CustomResourceDefinition {
        metadata: object_meta(&name, None, APP_COMPONENT),
        spec: CustomResourceDefinitionSpec {
            group: def.group.to_string(),
            names: CustomResourceDefinitionNames {
                kind: def.kind.to_string(),
                plural: def.plural.to_string(),
                singular: Some(def.singular.to_string()),
                short_names: Some(def.short_names.iter().map(|s| s.to_string()).collect()),
                categories: Some(vec!["all".to_string()]),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: "v1".to_string(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(json!({}))),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// CRDs of the virtualization API, one per resource the stack serves
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    CRDS.iter().map(new_crd).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_names_are_plural_dot_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), CRDS.len());
        let names: Vec<_> = crds.iter().map(|c| c.metadata.name.clone().unwrap()).collect();
        assert!(names.contains(&"virtualmachines.kubevirt.io".to_string()));
        assert!(names.contains(&"virtualmachineexports.export.kubevirt.io".to_string()));
        assert!(crds.iter().all(|c| c.spec.versions[0].storage));
    }
}
