//! PersistentVolumeClaim generation and inspection
//!
//! Each instance owns a data PVC named after the pod and, when the cluster
//! has a dedicated WAL volume, a `<pod>-wal` PVC. Resize progress is read
//! back from these objects on every pass.

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::controller::error::Result;
use crate::crd::{PostgresCluster, PvcRole, StorageSpec};
use crate::resources::common::{LABEL_INSTANCE, LABEL_PVC_ROLE, owned_metadata, pvc_labels};
use crate::resources::inheritance::InheritedMetadata;
use crate::resources::quantity::{format_quantity, parse_quantity};

pub const CONDITION_RESIZING: &str = "Resizing";
pub const CONDITION_FS_RESIZE_PENDING: &str = "FileSystemResizePending";

/// Name of an instance PVC
pub fn pvc_name(instance: &str, role: PvcRole) -> String {
    match role {
        PvcRole::Data => instance.to_string(),
        PvcRole::Wal => format!("{}-wal", instance),
    }
}

/// Storage configuration backing a PVC role, if the cluster has one
pub fn storage_for(cluster: &PostgresCluster, role: PvcRole) -> Option<&StorageSpec> {
    match role {
        PvcRole::Data => Some(&cluster.spec.storage),
        PvcRole::Wal => cluster.spec.wal_storage.as_ref(),
    }
}

/// PVC roles every instance of this cluster has
pub fn cluster_pvc_roles(cluster: &PostgresCluster) -> Vec<PvcRole> {
    if cluster.spec.wal_storage.is_some() {
        vec![PvcRole::Data, PvcRole::Wal]
    } else {
        vec![PvcRole::Data]
    }
}

/// Generate a PVC for an instance
pub fn generate_pvc(
    cluster: &PostgresCluster,
    instance: &str,
    role: PvcRole,
    size_bytes: u64,
    inherited: &InheritedMetadata,
) -> PersistentVolumeClaim {
    let storage = storage_for(cluster, role);

    PersistentVolumeClaim {
        metadata: owned_metadata(
            cluster,
            pvc_name(instance, role),
            pvc_labels(&cluster.name_any(), instance, role),
            inherited,
            false,
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.and_then(|s| s.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format_quantity(size_bytes)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Size requested in `spec.resources.requests.storage`
pub fn requested_bytes(pvc: &PersistentVolumeClaim) -> Result<Option<u64>> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

/// Size reported in `status.capacity.storage`
pub fn capacity_bytes(pvc: &PersistentVolumeClaim) -> Result<Option<u64>> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

/// True if the PVC carries the given condition with status True
pub fn has_condition(pvc: &PersistentVolumeClaim, type_: &str) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

pub fn pvc_role(pvc: &PersistentVolumeClaim) -> Option<PvcRole> {
    pvc.labels().get(LABEL_PVC_ROLE).and_then(|v| PvcRole::from_label(v))
}

pub fn pvc_instance(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.labels().get(LABEL_INSTANCE).map(String::as_str)
}
