use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackupTarget, LocalObjectReference};

/// Backup is a request for one base backup of a PostgresCluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgha.smoketurner.com",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    shortname = "pgbk",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cluster to back up
    pub cluster: LocalObjectReference,

    /// Overrides the cluster's backup target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    /// Instance the backup was taken from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// barman backup id (base/<id>/)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_wal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_wal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_lsn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_lsn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_id: Option<u32>,

    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    #[default]
    New,
    Running,
    Completed,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupPhase::Completed | BackupPhase::Failed)
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::New => write!(f, "New"),
            BackupPhase::Running => write!(f, "Running"),
            BackupPhase::Completed => write!(f, "Completed"),
            BackupPhase::Failed => write!(f, "Failed"),
        }
    }
}
