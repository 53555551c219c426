use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackupTarget, LocalObjectReference};

/// ScheduledBackup creates Backup objects on a cron schedule
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgha.smoketurner.com",
    version = "v1alpha1",
    kind = "ScheduledBackup",
    plural = "scheduledbackups",
    shortname = "pgsb",
    namespaced,
    status = "ScheduledBackupStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspended", "type":"boolean", "jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"Last", "type":"string", "jsonPath":".status.lastScheduleTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBackupSpec {
    /// Cron expression with a leading seconds field, e.g. "0 0 0 * * *"
    pub schedule: String,

    pub cluster: LocalObjectReference,

    /// Stop creating backups until cleared
    #[serde(default)]
    pub suspend: bool,

    /// Take a backup as soon as the schedule is first checked
    #[serde(default)]
    pub immediate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,

    /// Which object owns the generated backups
    #[serde(default)]
    pub backup_owner_reference: BackupOwnerReference,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackupOwnerReference {
    #[default]
    None,
    #[serde(rename = "self")]
    SelfRef,
    Cluster,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledBackupStatus {
    /// Last time the schedule was evaluated (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<String>,

    /// Time of the last backup created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<String>,
}
