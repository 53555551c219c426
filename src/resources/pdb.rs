//! PodDisruptionBudget resource generation for PostgreSQL clusters
//!
//! Two budgets protect a cluster during node maintenance: one for the
//! primary, which never allows a voluntary eviction (drains go through a
//! switchover first), and one for the standbys.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::PostgresCluster;
use crate::resources::common::{
    LABEL_CLUSTER, LABEL_INSTANCE_ROLE, ROLE_PRIMARY, ROLE_REPLICA, owned_metadata,
    standard_labels,
};
use crate::resources::inheritance::InheritedMetadata;

/// Generate the primary PodDisruptionBudget
///
/// Single-instance clusters get no primary budget so node drains are not
/// blocked forever.
pub fn generate_primary_pdb(
    cluster: &PostgresCluster,
    inherited: &InheritedMetadata,
) -> Option<PodDisruptionBudget> {
    if cluster.spec.instances < 2 {
        return None;
    }
    Some(build_pdb(
        cluster,
        inherited,
        format!("{}-primary", cluster.name_any()),
        ROLE_PRIMARY,
        1,
    ))
}

/// Generate the standby PodDisruptionBudget
///
/// The budget strategy depends on the standby count:
/// - 0 or 1 standby: min_available = 0
/// - n standbys: min_available = n - 1 (one disruption at a time)
pub fn generate_replica_pdb(
    cluster: &PostgresCluster,
    inherited: &InheritedMetadata,
) -> PodDisruptionBudget {
    let standbys = (cluster.spec.instances - 1).max(0);
    let min_available = (standbys - 1).max(0);
    build_pdb(
        cluster,
        inherited,
        cluster.name_any(),
        ROLE_REPLICA,
        min_available,
    )
}

fn build_pdb(
    cluster: &PostgresCluster,
    inherited: &InheritedMetadata,
    name: String,
    role: &str,
    min_available: i32,
) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();
    let match_labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.clone()),
        (LABEL_INSTANCE_ROLE.to_string(), role.to_string()),
    ]);

    PodDisruptionBudget {
        metadata: owned_metadata(
            cluster,
            name,
            standard_labels(&cluster_name),
            inherited,
            false,
        ),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            }),
            // Use IfHealthyBudget to allow eviction if pod is unhealthy
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
