use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgha.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of instances (one primary, the rest streaming standbys)
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// PostgreSQL container image
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// How the primary is updated once all standbys run the new image
    #[serde(default)]
    pub primary_update_method: PrimaryUpdateMethod,

    /// Storage for PGDATA
    pub storage: StorageSpec,

    /// Optional dedicated volume for pg_wal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_storage: Option<StorageSpec>,

    /// Resource requirements for PostgreSQL pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// PostgreSQL configuration and extensions
    #[serde(default)]
    pub postgresql: PostgresConfiguration,

    /// Replication slot management
    #[serde(default)]
    pub replication_slots: ReplicationSlotsSpec,

    /// Seconds to wait after the primary becomes unhealthy before failing over
    #[serde(default)]
    pub failover_delay: u32,

    /// TLS secrets bound to the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesSpec>,

    /// How the first instance is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSpec>,

    /// Clusters this cluster can import from or recover from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_clusters: Vec<ExternalCluster>,

    /// Base backup and WAL archive configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfiguration>,

    /// Labels and annotations copied onto every generated object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_metadata: Option<InheritedMetadataSpec>,
}

fn default_instances() -> i32 {
    1
}

pub const DEFAULT_IMAGE_NAME: &str = "ghcr.io/cloudnative-pg/postgresql:16";

fn default_image_name() -> String {
    DEFAULT_IMAGE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Strategy used for the primary during a rolling update
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PrimaryUpdateMethod {
    /// Promote an updated standby, then restart the old primary
    #[default]
    Switchover,
    /// Restart the primary in place
    Restart,
}

/// Storage configuration for a PostgreSQL volume
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,

    /// Automatic growth of the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeConfiguration>,
}

/// Automatic volume expansion
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResizeConfiguration {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub triggers: ResizeTriggers,

    #[serde(default)]
    pub expansion: ExpansionPolicy,

    #[serde(default)]
    pub strategy: ResizeStrategy,
}

/// Conditions that start an automatic resize
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTriggers {
    /// Used-space percentage that triggers growth
    #[serde(default = "default_usage_threshold")]
    pub usage_threshold: i32,

    /// Free space below which growth is triggered (e.g. "5Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
}

impl Default for ResizeTriggers {
    fn default() -> Self {
        Self {
            usage_threshold: default_usage_threshold(),
            min_available: None,
        }
    }
}

fn default_usage_threshold() -> i32 {
    80
}

/// How much a volume grows per action
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionPolicy {
    /// Percentage ("20%") or absolute quantity ("10Gi")
    #[serde(default = "default_step")]
    pub step: String,

    /// Lower clamp for percentage steps
    #[serde(default = "default_min_step")]
    pub min_step: String,

    /// Upper clamp for percentage steps
    #[serde(default = "default_max_step")]
    pub max_step: String,

    /// Maximum size the volume may reach
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self {
            step: default_step(),
            min_step: default_min_step(),
            max_step: default_max_step(),
            limit: None,
        }
    }
}

fn default_step() -> String {
    "20%".to_string()
}

fn default_min_step() -> String {
    "2Gi".to_string()
}

fn default_max_step() -> String {
    "500Gi".to_string()
}

/// Rate limits and safety checks for automatic resizes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResizeStrategy {
    #[serde(default = "default_max_actions_per_day")]
    pub max_actions_per_day: i32,

    #[serde(default)]
    pub wal_safety_policy: WalSafetyPolicy,
}

impl Default for ResizeStrategy {
    fn default() -> Self {
        Self {
            max_actions_per_day: default_max_actions_per_day(),
            wal_safety_policy: WalSafetyPolicy::default(),
        }
    }
}

fn default_max_actions_per_day() -> i32 {
    3
}

/// Guards against growing a volume whose usage comes from stuck WAL
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalSafetyPolicy {
    /// Required to auto-resize a volume that shares data and WAL
    #[serde(default, rename = "acknowledgeWALRisk")]
    pub acknowledge_wal_risk: bool,

    #[serde(default = "default_true")]
    pub require_archive_healthy: bool,

    #[serde(default = "default_max_pending_wal_files", rename = "maxPendingWALFiles")]
    pub max_pending_wal_files: i32,

    /// Maximum WAL retained by inactive replication slots (e.g. "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slot_retention: Option<String>,
}

impl Default for WalSafetyPolicy {
    fn default() -> Self {
        Self {
            acknowledge_wal_risk: false,
            require_archive_healthy: true,
            max_pending_wal_files: default_max_pending_wal_files(),
            max_slot_retention: None,
        }
    }
}

fn default_max_pending_wal_files() -> i32 {
    100
}

/// Resource requirements for PostgreSQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU and memory limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// CPU and memory requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// PostgreSQL parameters and extensions
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfiguration {
    /// postgresql.conf parameters, handed to the instance manager
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Extensions created in the application database
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionSpec>,
}

/// A PostgreSQL extension to create
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Database to create the extension in (defaults to the bootstrap database)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Replication slot settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsSpec {
    #[serde(default)]
    pub high_availability: HaReplicationSlotsSpec,
}

/// Physical slots on the primary, one per standby
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HaReplicationSlotsSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
}

impl Default for HaReplicationSlotsSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            slot_prefix: default_slot_prefix(),
        }
    }
}

pub const DEFAULT_SLOT_PREFIX: &str = "_pgha_";

fn default_slot_prefix() -> String {
    DEFAULT_SLOT_PREFIX.to_string()
}

/// TLS secrets bound to the cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesSpec {
    #[serde(default, rename = "serverTLSSecret", skip_serializing_if = "Option::is_none")]
    pub server_tls_secret: Option<String>,

    #[serde(default, rename = "serverCASecret", skip_serializing_if = "Option::is_none")]
    pub server_ca_secret: Option<String>,

    #[serde(default, rename = "clientCASecret", skip_serializing_if = "Option::is_none")]
    pub client_ca_secret: Option<String>,

    #[serde(default, rename = "replicationTLSSecret", skip_serializing_if = "Option::is_none")]
    pub replication_tls_secret: Option<String>,

    /// cert-manager issuer used for roles without a user-provided secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,
}

/// Reference to a cert-manager Issuer or ClusterIssuer
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,

    #[serde(default)]
    pub kind: IssuerKind,

    #[serde(default = "default_issuer_group")]
    pub group: String,
}

fn default_issuer_group() -> String {
    "cert-manager.io".to_string()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum IssuerKind {
    Issuer,
    #[default]
    ClusterIssuer,
}

impl std::fmt::Display for IssuerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssuerKind::Issuer => write!(f, "Issuer"),
            IssuerKind::ClusterIssuer => write!(f, "ClusterIssuer"),
        }
    }
}

/// Bootstrap method for the first instance. Exactly one must be set.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initdb: Option<InitDbSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoverySpec>,
}

/// Create a fresh cluster with initdb
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitDbSpec {
    #[serde(default = "default_app_name")]
    pub database: String,

    #[serde(default = "default_app_name")]
    pub owner: String,

    /// Logical import from an external cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportSpec>,
}

impl Default for InitDbSpec {
    fn default() -> Self {
        Self {
            database: default_app_name(),
            owner: default_app_name(),
            import: None,
        }
    }
}

pub const DEFAULT_APP_DATABASE: &str = "app";

fn default_app_name() -> String {
    DEFAULT_APP_DATABASE.to_string()
}

/// Logical import of databases from an external cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpec {
    #[serde(rename = "type")]
    pub type_: ImportType,

    #[serde(default)]
    pub databases: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    pub source: ImportSource,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ImportType {
    /// One database imported into the application database
    Microservice,
    /// Several databases and roles imported as-is
    Monolith,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportSource {
    pub external_cluster: String,
}

/// Restore the first instance from a base backup plus WAL
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySpec {
    /// A completed Backup object in the same namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<LocalObjectReference>,

    /// Name of an external cluster with an object store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_target: Option<RecoveryTarget>,
}

/// Point-in-time recovery target
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTarget {
    /// RFC 3339 or PostgreSQL timestamp to stop replay at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time: Option<String>,

    /// Stop just before the target instead of just after it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// A cluster outside this one, used as import or recovery source
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barman_object_store: Option<ObjectStoreConfiguration>,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    pub barman_object_store: ObjectStoreConfiguration,

    #[serde(default)]
    pub target: BackupTarget,
}

/// Which instance runs base backups
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackupTarget {
    Primary,
    #[default]
    PreferStandby,
}

/// S3-compatible object store used by barman-cloud
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreConfiguration {
    /// e.g. "s3://backups/prod"
    pub destination_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// Folder name inside the destination (defaults to the cluster name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    pub s3_credentials: S3Credentials,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Credentials {
    pub access_key_id: SecretKeySelector,
    pub secret_access_key: SecretKeySelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

/// Metadata copied onto every generated object
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InheritedMetadataSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl PostgresClusterSpec {
    /// Name of the database extensions and imports land in
    pub fn app_database(&self) -> &str {
        self.bootstrap
            .as_ref()
            .and_then(|b| b.initdb.as_ref())
            .map(|i| i.database.as_str())
            .unwrap_or(DEFAULT_APP_DATABASE)
    }

    pub fn recovery(&self) -> Option<&RecoverySpec> {
        self.bootstrap.as_ref().and_then(|b| b.recovery.as_ref())
    }

    pub fn external_cluster(&self, name: &str) -> Option<&ExternalCluster> {
        self.external_clusters.iter().find(|c| c.name == name)
    }
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable explanation of the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_reason: Option<String>,

    /// Number of instances observed
    #[serde(default)]
    pub instances: i32,

    /// Number of ready instances
    #[serde(default)]
    pub ready_instances: i32,

    /// Instances that belong to the cluster, ordered by serial
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_names: Vec<String>,

    /// Highest instance serial handed out so far
    #[serde(default)]
    pub latest_generated_node: i32,

    /// Instance currently acting as primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Instance that should become primary ("pending" while a failover elects one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,

    /// In-flight promotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionStatus>,

    /// When the current primary was first seen unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_failing_since: Option<String>,

    /// When the fence on an unhealthy primary was lifted; failover waits
    /// for it to restart until the recovery window runs out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fence_lifted_at: Option<String>,

    /// Timeline reported by the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_id: Option<u32>,

    /// Mirror of the fence annotation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fenced_instances: Vec<String>,

    /// Instances the operator fenced because a volume filled up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk_pressure_instances: Vec<String>,

    /// Logical certificate role to bound secret name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub certificates: BTreeMap<String, String>,

    /// Resize progress for each PVC, derived from the PVC objects
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<VolumeResizeStatus>,

    /// History of automatic resizes, used for rate limiting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_resize_events: Vec<AutoResizeEvent>,

    /// HA replication slots observed on the primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ha_replication_slots: Vec<String>,

    /// HA replication slots observed on each standby
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub standby_replication_slots: BTreeMap<String, Vec<String>>,

    /// Extension application status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionStatus>,

    /// End time of the oldest base backup in the catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_recoverability_point: Option<String>,

    /// End time of the newest successful base backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup: Option<String>,

    /// Resolved point-in-time recovery plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryStatus>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PostgresClusterStatus {
    /// True while a promotion (failover or switchover) is in flight
    pub fn promotion_in_progress(&self) -> bool {
        self.target_primary.is_some() && self.target_primary != self.current_primary
    }
}

/// Marker stored in targetPrimary while a failover candidate is being elected
pub const PENDING_FAILOVER_MARKER: &str = "pending";

/// An in-flight change of primary
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromotionStatus {
    pub kind: PromotionKind,

    /// Primary being replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// RFC 3339 timestamp of the request
    pub requested_at: String,

    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PromotionKind {
    /// Unplanned, after primary loss
    Failover,
    /// Planned, the old primary is demoted first
    Switchover,
}

impl std::fmt::Display for PromotionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionKind::Failover => write!(f, "Failover"),
            PromotionKind::Switchover => write!(f, "Switchover"),
        }
    }
}

/// Role of a PVC within an instance
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PvcRole {
    #[serde(rename = "PG_DATA")]
    Data,
    #[serde(rename = "PG_WAL")]
    Wal,
}

impl PvcRole {
    pub fn as_label(&self) -> &'static str {
        match self {
            PvcRole::Data => "PG_DATA",
            PvcRole::Wal => "PG_WAL",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "PG_DATA" => Some(PvcRole::Data),
            "PG_WAL" => Some(PvcRole::Wal),
            _ => None,
        }
    }
}

impl std::fmt::Display for PvcRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Resize progress of one PVC
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResizeStatus {
    pub pvc_name: String,
    pub instance: String,
    pub role: PvcRole,
    /// Desired size computed this pass
    pub desired: String,
    /// spec.resources.requests.storage
    pub requested: String,
    /// status.capacity.storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    pub state: ResizeState,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ResizeState {
    /// Capacity matches the desired size
    UpToDate,
    /// The request still has to be raised
    Pending,
    /// Request raised, waiting for the volume to grow
    Resizing,
    /// Volume grew, filesystem expansion waits for a pod restart
    FileSystemResizePending,
}

/// One automatic resize action
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoResizeEvent {
    pub pvc_name: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub from: String,
    pub to: String,
}

/// Whether an extension was created
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub name: String,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resolved point-in-time recovery plan
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub backup_id: String,
    pub source_timeline: u32,
    pub begin_wal: String,
    pub end_wal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time: Option<String>,
    /// Timeline the restored cluster is expected to promote onto
    pub expected_timeline: u32,
    /// All required WAL segments were found in the object store
    pub verified: bool,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Cluster is waiting to be created
    #[default]
    Pending,
    /// First instance is being bootstrapped
    Initializing,
    /// All instances are ready and the primary is serving
    Ready,
    /// Instances are being added or removed
    Scaling,
    /// Instances are being restarted onto a new image
    Upgrading,
    /// At least one PVC is growing
    Resizing,
    /// Primary was lost, a standby is being promoted
    FailingOver,
    /// Planned change of primary
    Switchover,
    /// Cluster is serving without full redundancy, or has no eligible standby
    Degraded,
    /// An instance was fenced because a volume filled up
    NotEnoughDiskSpace,
    /// Point-in-time recovery target could not be resolved
    RecoveryFailed,
    /// Cluster is being deleted
    Deleting,
}

impl ClusterPhase {
    /// Phases that should be polled quickly
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ClusterPhase::Pending
                | ClusterPhase::Initializing
                | ClusterPhase::Scaling
                | ClusterPhase::Upgrading
                | ClusterPhase::Resizing
                | ClusterPhase::FailingOver
                | ClusterPhase::Switchover
        )
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Ready => write!(f, "Ready"),
            ClusterPhase::Scaling => write!(f, "Scaling"),
            ClusterPhase::Upgrading => write!(f, "Upgrading"),
            ClusterPhase::Resizing => write!(f, "Resizing"),
            ClusterPhase::FailingOver => write!(f, "FailingOver"),
            ClusterPhase::Switchover => write!(f, "Switchover"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::NotEnoughDiskSpace => write!(f, "NotEnoughDiskSpace"),
            ClusterPhase::RecoveryFailed => write!(f, "RecoveryFailed"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
