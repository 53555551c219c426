//! Common utilities for Kubernetes resource generation
//!
//! Label keys, owner references and object metadata shared by every
//! generated object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PostgresCluster, PvcRole};
use crate::resources::inheritance::InheritedMetadata;

pub const API_VERSION: &str = "pgha.smoketurner.com/v1alpha1";
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "pgha-operator";

pub const LABEL_CLUSTER: &str = "pgha.smoketurner.com/cluster";
pub const LABEL_INSTANCE: &str = "pgha.smoketurner.com/instanceName";
pub const LABEL_INSTANCE_ROLE: &str = "pgha.smoketurner.com/instanceRole";
pub const LABEL_FENCED: &str = "pgha.smoketurner.com/fenced";
pub const LABEL_PVC_ROLE: &str = "pgha.smoketurner.com/pvcRole";
pub const LABEL_SCHEDULED_BACKUP: &str = "pgha.smoketurner.com/scheduled-backup";
pub const LABEL_IMMEDIATE_BACKUP: &str = "pgha.smoketurner.com/immediateBackup";
pub const LABEL_BACKUP_CLUSTER: &str = "pgha.smoketurner.com/backup-cluster";

/// JSON array of fenced instance names, `["*"]` fences all
pub const ANNOTATION_FENCED_INSTANCES: &str = "pgha.smoketurner.com/fencedInstances";

pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_REPLICA: &str = "replica";

/// Generate an owner reference for a PostgresCluster
///
/// All child resources are garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels carried by every object belonging to a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector string for listing a cluster's pods and PVCs
pub fn cluster_label_selector(cluster_name: &str) -> String {
    format!("{}={}", LABEL_CLUSTER, cluster_name)
}

/// Labels of an instance pod
pub fn instance_labels(
    cluster_name: &str,
    instance: &str,
    is_primary: bool,
    fenced: bool,
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(LABEL_INSTANCE.to_string(), instance.to_string());
    labels.insert(
        LABEL_INSTANCE_ROLE.to_string(),
        role_label(is_primary).to_string(),
    );
    labels.insert(LABEL_FENCED.to_string(), fenced.to_string());
    labels
}

/// Labels of an instance PVC
pub fn pvc_labels(cluster_name: &str, instance: &str, role: PvcRole) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(LABEL_INSTANCE.to_string(), instance.to_string());
    labels.insert(LABEL_PVC_ROLE.to_string(), role.as_label().to_string());
    labels
}

pub fn role_label(is_primary: bool) -> &'static str {
    if is_primary { ROLE_PRIMARY } else { ROLE_REPLICA }
}

/// Metadata for a cluster-owned object
///
/// Operator labels win over inherited ones with the same key.
pub fn owned_metadata(
    cluster: &PostgresCluster,
    name: String,
    labels: BTreeMap<String, String>,
    inherited: &InheritedMetadata,
    is_pod: bool,
) -> ObjectMeta {
    let (inherited_labels, inherited_annotations) = if is_pod {
        (&inherited.pod_labels, &inherited.pod_annotations)
    } else {
        (&inherited.labels, &inherited.annotations)
    };

    let mut merged = inherited_labels.clone();
    merged.extend(labels);

    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(merged),
        annotations: if inherited_annotations.is_empty() {
            None
        } else {
            Some(inherited_annotations.clone())
        },
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}
