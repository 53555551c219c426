//! Instance pod generation
//!
//! Instances are bare pods named `<cluster>-<serial>`, created and deleted by
//! the operator one at a time. The pod carries its role as a label; the
//! instance manager inside the image reads the bootstrap environment on
//! first start.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, PersistentVolumeClaimVolumeSource, Pod, PodAffinityTerm, PodAntiAffinity,
    PodSpec, Probe, ResourceRequirements as K8sResourceRequirements, SecretKeySelector as K8sSecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use crate::controller::slots::ha_slot_name;
use crate::crd::{
    ExternalCluster, ImportSpec, ObjectStoreConfiguration, PostgresCluster, PvcRole,
    ResourceList, SecretKeySelector,
};
use crate::postgres::{PGDATA_MOUNT, PGDATA_PATH, PGWAL_MOUNT, POSTGRES_CONTAINER};
use crate::resources::certificate::{ROLE_CLIENT_CA, ROLE_REPLICATION_TLS, ROLE_SERVER_TLS};
use crate::resources::common::{LABEL_CLUSTER, instance_labels, owned_metadata};
use crate::resources::inheritance::InheritedMetadata;
use crate::resources::pvc::pvc_name;
use crate::resources::service::{POSTGRES_PORT, ServiceKind, service_name};

/// Name of the instance with the given serial
pub fn instance_name(cluster_name: &str, serial: i32) -> String {
    format!("{}-{}", cluster_name, serial)
}

/// Serial of an instance name, if it belongs to the cluster
pub fn parse_serial(cluster_name: &str, instance: &str) -> Option<i32> {
    instance
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
        .filter(|serial| *serial > 0)
}

/// Restore parameters handed to the first instance of a recovered cluster
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryBootstrap {
    pub backup_id: String,
    pub object_store: ObjectStoreConfiguration,
    pub server_name: String,
    pub target_time: Option<String>,
    pub exclusive: bool,
}

/// How a new instance gets its data directory
#[derive(Clone, Debug, PartialEq)]
pub enum BootstrapMode {
    /// Fresh cluster with initdb
    Initdb,
    /// initdb followed by a logical import
    Import {
        import: ImportSpec,
        source: ExternalCluster,
    },
    /// Restore from a base backup and replay WAL
    Recovery(RecoveryBootstrap),
    /// Clone the current primary and stream from it
    Join,
}

impl BootstrapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapMode::Initdb => "initdb",
            BootstrapMode::Import { .. } => "import",
            BootstrapMode::Recovery(_) => "recovery",
            BootstrapMode::Join => "join",
        }
    }
}

/// Everything that varies between the instances of one cluster
#[derive(Clone, Debug)]
pub struct InstanceParams<'a> {
    pub serial: i32,
    pub is_primary: bool,
    pub fenced: bool,
    pub bootstrap: BootstrapMode,
    /// Certificate role to secret name, as published in status
    pub certificates: &'a BTreeMap<String, String>,
}

/// Generate the pod of one instance
pub fn generate_instance_pod(
    cluster: &PostgresCluster,
    params: &InstanceParams<'_>,
    inherited: &InheritedMetadata,
) -> Pod {
    let cluster_name = cluster.name_any();
    let name = instance_name(&cluster_name, params.serial);
    let labels = instance_labels(&cluster_name, &name, params.is_primary, params.fenced);

    let mut volumes = vec![
        Volume {
            name: "pgdata".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&name, PvcRole::Data),
                read_only: None,
            }),
            ..Default::default()
        },
        Volume {
            name: "shm".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "pgdata".to_string(),
            mount_path: PGDATA_MOUNT.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "shm".to_string(),
            mount_path: "/dev/shm".to_string(),
            ..Default::default()
        },
    ];

    if cluster.spec.wal_storage.is_some() {
        volumes.push(Volume {
            name: "pgwal".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&name, PvcRole::Wal),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "pgwal".to_string(),
            mount_path: PGWAL_MOUNT.to_string(),
            ..Default::default()
        });
    }

    for (role, mount_path) in [
        (ROLE_SERVER_TLS, "/etc/pgha/tls/server"),
        (ROLE_REPLICATION_TLS, "/etc/pgha/tls/replication"),
        (ROLE_CLIENT_CA, "/etc/pgha/tls/client-ca"),
    ] {
        if let Some(secret) = params.certificates.get(role) {
            let volume_name = format!("tls-{}", mount_path.rsplit('/').next().unwrap_or(role));
            volumes.push(Volume {
                name: volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    default_mode: Some(0o600),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume_name,
                mount_path: mount_path.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    let container = Container {
        name: POSTGRES_CONTAINER.to_string(),
        image: Some(cluster.spec.image_name.clone()),
        ports: Some(vec![ContainerPort {
            container_port: POSTGRES_PORT,
            name: Some("postgresql".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(instance_env(cluster, &name, params)),
        volume_mounts: Some(mounts),
        resources: cluster.spec.resources.as_ref().map(|r| K8sResourceRequirements {
            limits: r.limits.as_ref().map(resource_list),
            requests: r.requests.as_ref().map(resource_list),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "pg_isready".to_string(),
                    "-U".to_string(),
                    "postgres".to_string(),
                    "-h".to_string(),
                    "localhost".to_string(),
                ]),
            }),
            period_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: owned_metadata(cluster, name.clone(), labels, inherited, true),
        spec: Some(PodSpec {
            hostname: Some(name),
            containers: vec![container],
            volumes: Some(volumes),
            affinity: Some(anti_affinity(&cluster_name)),
            termination_grace_period_seconds: Some(60),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_list(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    out
}

/// Spread instances of a cluster across nodes
fn anti_affinity(cluster_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                LABEL_CLUSTER.to_string(),
                                cluster_name.to_string(),
                            )])),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, selector: &SecretKeySelector) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(K8sSecretKeySelector {
                name: selector.name.clone(),
                key: selector.key.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn object_store_env(store: &ObjectStoreConfiguration, out: &mut Vec<EnvVar>) {
    out.push(secret_env(
        "AWS_ACCESS_KEY_ID",
        &store.s3_credentials.access_key_id,
    ));
    out.push(secret_env(
        "AWS_SECRET_ACCESS_KEY",
        &store.s3_credentials.secret_access_key,
    ));
    if let Some(region) = &store.region {
        out.push(env("AWS_DEFAULT_REGION", region.clone()));
    }
}

/// Environment consumed by the instance manager
pub fn instance_env(cluster: &PostgresCluster, instance: &str, params: &InstanceParams<'_>) -> Vec<EnvVar> {
    let cluster_name = cluster.name_any();
    let mut out = vec![
        env("PGHA_CLUSTER", cluster_name.clone()),
        env("PGHA_INSTANCE", instance),
        env("PGHA_PRIMARY_HOST", service_name(&cluster_name, ServiceKind::ReadWrite)),
        env("PGHA_BOOTSTRAP_MODE", params.bootstrap.as_str()),
        env("PGHA_APP_DATABASE", cluster.spec.app_database()),
        env("PGDATA", PGDATA_PATH),
    ];

    if cluster.spec.wal_storage.is_some() {
        out.push(env("PGHA_WAL_DIR", format!("{}/pg_wal", PGWAL_MOUNT)));
    }

    let slots = &cluster.spec.replication_slots.high_availability;
    if slots.enabled {
        out.push(env("PGHA_SLOT_NAME", ha_slot_name(&slots.slot_prefix, instance)));
    }

    if !cluster.spec.postgresql.parameters.is_empty() {
        let rendered: Vec<String> = cluster
            .spec
            .postgresql
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push(env("PGHA_PARAMETERS", rendered.join("\n")));
    }

    if let Some(backup) = &cluster.spec.backup {
        let store = &backup.barman_object_store;
        out.push(env("PGHA_ARCHIVE_DESTINATION", store.destination_path.clone()));
        out.push(env(
            "PGHA_ARCHIVE_SERVER_NAME",
            store.server_name.clone().unwrap_or_else(|| cluster_name.clone()),
        ));
        if let Some(endpoint) = &store.endpoint_url {
            out.push(env("PGHA_ARCHIVE_ENDPOINT", endpoint.clone()));
        }
        object_store_env(store, &mut out);
    }

    match &params.bootstrap {
        BootstrapMode::Recovery(recovery) => {
            out.push(env("PGHA_RECOVERY_BACKUP_ID", recovery.backup_id.clone()));
            out.push(env(
                "PGHA_RECOVERY_DESTINATION",
                recovery.object_store.destination_path.clone(),
            ));
            out.push(env("PGHA_RECOVERY_SERVER_NAME", recovery.server_name.clone()));
            if let Some(endpoint) = &recovery.object_store.endpoint_url {
                out.push(env("PGHA_RECOVERY_ENDPOINT", endpoint.clone()));
            }
            if let Some(target) = &recovery.target_time {
                out.push(env("PGHA_RECOVERY_TARGET_TIME", target.clone()));
                out.push(env(
                    "PGHA_RECOVERY_TARGET_INCLUSIVE",
                    (!recovery.exclusive).to_string(),
                ));
            }
            if cluster.spec.backup.as_ref().map(|b| &b.barman_object_store)
                != Some(&recovery.object_store)
            {
                out.retain(|e| e.name != "AWS_ACCESS_KEY_ID" && e.name != "AWS_SECRET_ACCESS_KEY");
                object_store_env(&recovery.object_store, &mut out);
            }
        }
        BootstrapMode::Import { import, source } => {
            out.push(env("PGHA_IMPORT_TYPE", format!("{:?}", import.type_).to_lowercase()));
            out.push(env("PGHA_IMPORT_DATABASES", import.databases.join(",")));
            if !import.roles.is_empty() {
                out.push(env("PGHA_IMPORT_ROLES", import.roles.join(",")));
            }
            let conninfo: Vec<String> = source
                .connection_parameters
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            out.push(env("PGHA_IMPORT_SOURCE", conninfo.join(" ")));
        }
        BootstrapMode::Initdb | BootstrapMode::Join => {}
    }

    out
}

/// Image the postgres container of a pod runs
pub fn pod_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == POSTGRES_CONTAINER)?
        .image
        .as_deref()
}
