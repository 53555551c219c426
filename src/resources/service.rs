//! Service generation for PostgreSQL clusters
//!
//! Routing follows the role labels the operator writes on instance pods.
//! Every selector requires `fenced=false`, so a fenced instance drops out of
//! all services.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::PostgresCluster;
use crate::resources::common::{
    LABEL_CLUSTER, LABEL_FENCED, LABEL_INSTANCE_ROLE, ROLE_PRIMARY, ROLE_REPLICA,
    owned_metadata, standard_labels,
};
use crate::resources::inheritance::InheritedMetadata;

pub const POSTGRES_PORT: i32 = 5432;

/// Which instances a service routes to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// `<cluster>-rw`, the current primary
    ReadWrite,
    /// `<cluster>-ro`, standbys only
    ReadOnly,
    /// `<cluster>-r`, any instance
    Read,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::ReadWrite, ServiceKind::ReadOnly, ServiceKind::Read];

    pub fn suffix(&self) -> &'static str {
        match self {
            ServiceKind::ReadWrite => "rw",
            ServiceKind::ReadOnly => "ro",
            ServiceKind::Read => "r",
        }
    }

    fn role(&self) -> Option<&'static str> {
        match self {
            ServiceKind::ReadWrite => Some(ROLE_PRIMARY),
            ServiceKind::ReadOnly => Some(ROLE_REPLICA),
            ServiceKind::Read => None,
        }
    }
}

/// Name of a cluster service
pub fn service_name(cluster_name: &str, kind: ServiceKind) -> String {
    format!("{}-{}", cluster_name, kind.suffix())
}

/// Generate one of the cluster services
pub fn generate_service(
    cluster: &PostgresCluster,
    kind: ServiceKind,
    inherited: &InheritedMetadata,
) -> Service {
    let cluster_name = cluster.name_any();

    let mut selector = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.clone()),
        (LABEL_FENCED.to_string(), "false".to_string()),
    ]);
    if let Some(role) = kind.role() {
        selector.insert(LABEL_INSTANCE_ROLE.to_string(), role.to_string());
    }

    Service {
        metadata: owned_metadata(
            cluster,
            service_name(&cluster_name, kind),
            standard_labels(&cluster_name),
            inherited,
            false,
        ),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::Int(POSTGRES_PORT)),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate all cluster services
pub fn generate_services(cluster: &PostgresCluster, inherited: &InheritedMetadata) -> Vec<Service> {
    ServiceKind::ALL
        .iter()
        .map(|kind| generate_service(cluster, *kind, inherited))
        .collect()
}
