//! Commands run against a PostgreSQL instance
//!
//! The reconciler never opens database connections. It runs `psql`, `pg_ctl`
//! `df` and `barman-cloud-backup` inside the instance pod through the exec
//! subresource. [`InstanceClient`] is the seam the planners are tested
//! against.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::lsn::Lsn;
use super::{PGDATA_PATH, POSTGRES_CONTAINER};
use crate::controller::error::{Error, Result};
use crate::crd::ExtensionSpec;

/// What an instance reports about itself
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceStatus {
    /// `pg_is_in_recovery()` is false
    pub is_primary: bool,
    pub timeline: Option<u32>,
    pub receive_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
    /// Current write position on a primary
    pub current_lsn: Option<Lsn>,
    /// A WAL receiver process is streaming
    pub wal_receiver_active: bool,
}

/// Filesystem usage of a mounted volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl VolumeUsage {
    pub fn percent_used(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = (u128::from(self.used_bytes) * 100) / u128::from(self.total_bytes);
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InactiveSlot {
    pub name: String,
    pub retained_bytes: u64,
}

/// WAL archiving health used by the auto-resize safety checks
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalHealth {
    pub archive_healthy: bool,
    /// `.ready` files in archive_status
    pub pending_wal_files: u32,
    pub inactive_slots: Vec<InactiveSlot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledExtension {
    pub name: String,
    pub version: String,
}

/// Arguments for a barman-cloud base backup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRequest {
    /// Backup object name, passed as `--name`
    pub name: String,
    pub destination_path: String,
    pub server_name: String,
    pub endpoint_url: Option<String>,
}

#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn status(&self, namespace: &str, pod: &str) -> Result<InstanceStatus>;

    /// Leave recovery and start accepting writes
    async fn promote(&self, namespace: &str, pod: &str) -> Result<()>;

    /// Fast shutdown, the instance manager restarts it as a standby
    async fn demote(&self, namespace: &str, pod: &str) -> Result<()>;

    async fn volume_usage(&self, namespace: &str, pod: &str, path: &str) -> Result<VolumeUsage>;

    async fn wal_health(&self, namespace: &str, pod: &str) -> Result<WalHealth>;

    async fn list_replication_slots(
        &self,
        namespace: &str,
        pod: &str,
        prefix: &str,
    ) -> Result<Vec<ReplicationSlot>>;

    async fn create_replication_slot(&self, namespace: &str, pod: &str, name: &str) -> Result<()>;

    async fn drop_replication_slot(&self, namespace: &str, pod: &str, name: &str) -> Result<()>;

    /// Move a slot's restart position forward; never moves it back
    async fn advance_replication_slot(&self, namespace: &str, pod: &str, name: &str, lsn: Lsn) -> Result<()>;

    async fn list_extensions(
        &self,
        namespace: &str,
        pod: &str,
        database: &str,
    ) -> Result<Vec<InstalledExtension>>;

    async fn create_extension(
        &self,
        namespace: &str,
        pod: &str,
        database: &str,
        extension: &ExtensionSpec,
    ) -> Result<()>;

    /// Launch a detached base backup
    async fn start_backup(&self, namespace: &str, pod: &str, request: &BackupRequest) -> Result<()>;
}

/// [`InstanceClient`] backed by the pod exec subresource
#[derive(Clone)]
pub struct ExecInstanceClient {
    client: Client,
}

impl ExecInstanceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Execute a command in the postgres container and return stdout
    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let attach_params = AttachParams {
            container: Some(POSTGRES_CONTAINER.to_string()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let mut attached = pods.exec(pod, command, &attach_params).await?;

        let mut stdout_reader = attached.stdout().ok_or_else(|| Error::ExecFailed {
            pod: pod.to_string(),
            message: "no stdout available".to_string(),
        })?;
        let mut stderr_reader = attached.stderr();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_stderr = async {
            if let Some(reader) = stderr_reader.as_mut() {
                let _ = reader.read_to_end(&mut stderr).await;
            }
        };
        let (read, ()) = tokio::join!(stdout_reader.read_to_end(&mut stdout), read_stderr);
        read.map_err(|e| Error::ExecFailed {
            pod: pod.to_string(),
            message: format!("failed to read stdout: {}", e),
        })?;

        if let Some(status_channel) = attached.take_status()
            && let Some(result) = status_channel.await
            && let Some(status) = result.status
            && status != "Success"
        {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            debug!(pod, status, %message, "command exited with non-success status");
            return Err(Error::ExecFailed {
                pod: pod.to_string(),
                message: if message.is_empty() {
                    result.message.unwrap_or(status)
                } else {
                    message
                },
            });
        }

        String::from_utf8(stdout).map_err(|e| Error::ExecFailed {
            pod: pod.to_string(),
            message: format!("stdout is not UTF-8: {}", e),
        })
    }

    async fn psql(&self, namespace: &str, pod: &str, database: &str, query: &str) -> Result<String> {
        self.exec(namespace, pod, psql_command(database, query)).await
    }
}

fn psql_command(database: &str, query: &str) -> Vec<String> {
    [
        "psql",
        "-U",
        "postgres",
        "-d",
        database,
        "-v",
        "ON_ERROR_STOP=1",
        "-tAX",
        "-F",
        ",",
        "-c",
        query,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// The checkpoint timeline lags a fresh promotion until the end-of-recovery
// checkpoint completes, so a primary reports the timeline of its WAL file
const STATUS_QUERY: &str = "SELECT pg_is_in_recovery(), \
    COALESCE(\
        CASE WHEN pg_is_in_recovery() THEN NULL \
        ELSE ('x' || substr(pg_walfile_name(pg_current_wal_lsn()), 1, 8))::bit(32)::int END, \
        (SELECT timeline_id FROM pg_control_checkpoint())), \
    pg_last_wal_receive_lsn(), \
    pg_last_wal_replay_lsn(), \
    CASE WHEN pg_is_in_recovery() THEN NULL ELSE pg_current_wal_lsn() END, \
    (SELECT count(*) FROM pg_stat_wal_receiver WHERE status = 'streaming')";

const WAL_HEALTH_QUERY: &str = "SELECT \
    (SELECT count(*) FROM pg_ls_archive_statusdir() WHERE name LIKE '%.ready'), \
    COALESCE(last_failed_time > last_archived_time, last_failed_time IS NOT NULL, false) \
    FROM pg_stat_archiver";

const INACTIVE_SLOTS_QUERY: &str = "SELECT slot_name, \
    pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::bigint \
    FROM pg_replication_slots \
    WHERE NOT active AND restart_lsn IS NOT NULL AND NOT pg_is_in_recovery()";

#[async_trait]
impl InstanceClient for ExecInstanceClient {
    async fn status(&self, namespace: &str, pod: &str) -> Result<InstanceStatus> {
        let output = self.psql(namespace, pod, "postgres", STATUS_QUERY).await?;
        parse_instance_status(&output).ok_or_else(|| Error::ExecFailed {
            pod: pod.to_string(),
            message: format!("unexpected status output '{}'", output.trim()),
        })
    }

    async fn promote(&self, namespace: &str, pod: &str) -> Result<()> {
        let output = self
            .psql(namespace, pod, "postgres", "SELECT pg_promote(true, 60)")
            .await?;
        if output.trim() != "t" {
            return Err(Error::ExecFailed {
                pod: pod.to_string(),
                message: "pg_promote did not complete".to_string(),
            });
        }
        Ok(())
    }

    async fn demote(&self, namespace: &str, pod: &str) -> Result<()> {
        let command = ["pg_ctl", "stop", "-m", "fast", "-w", "-D", PGDATA_PATH]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.exec(namespace, pod, command).await.map(|_| ())
    }

    async fn volume_usage(&self, namespace: &str, pod: &str, path: &str) -> Result<VolumeUsage> {
        let command = ["df", "-B1", "--output=size,used,avail", path]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.exec(namespace, pod, command).await?;
        parse_df_output(&output).ok_or_else(|| Error::ExecFailed {
            pod: pod.to_string(),
            message: format!("unexpected df output '{}'", output.trim()),
        })
    }

    async fn wal_health(&self, namespace: &str, pod: &str) -> Result<WalHealth> {
        let output = self.psql(namespace, pod, "postgres", WAL_HEALTH_QUERY).await?;
        let mut health = parse_wal_health(&output).ok_or_else(|| Error::ExecFailed {
            pod: pod.to_string(),
            message: format!("unexpected archiver output '{}'", output.trim()),
        })?;
        let slots = self
            .psql(namespace, pod, "postgres", INACTIVE_SLOTS_QUERY)
            .await?;
        health.inactive_slots = parse_inactive_slots(&slots);
        Ok(health)
    }

    async fn list_replication_slots(
        &self,
        namespace: &str,
        pod: &str,
        prefix: &str,
    ) -> Result<Vec<ReplicationSlot>> {
        validate_slot_name(prefix)?;
        let query = format!(
            "SELECT slot_name, active, restart_lsn FROM pg_replication_slots \
             WHERE slot_type = 'physical' AND starts_with(slot_name, '{}') ORDER BY slot_name",
            prefix
        );
        let output = self.psql(namespace, pod, "postgres", &query).await?;
        Ok(parse_replication_slots(&output))
    }

    async fn create_replication_slot(&self, namespace: &str, pod: &str, name: &str) -> Result<()> {
        validate_slot_name(name)?;
        let query = format!(
            "SELECT pg_create_physical_replication_slot('{}', true) \
             WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}')",
            name, name
        );
        self.psql(namespace, pod, "postgres", &query).await.map(|_| ())
    }

    async fn drop_replication_slot(&self, namespace: &str, pod: &str, name: &str) -> Result<()> {
        validate_slot_name(name)?;
        let query = format!(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
             WHERE slot_name = '{}' AND NOT active",
            name
        );
        self.psql(namespace, pod, "postgres", &query).await.map(|_| ())
    }

    async fn advance_replication_slot(&self, namespace: &str, pod: &str, name: &str, lsn: Lsn) -> Result<()> {
        validate_slot_name(name)?;
        let query = format!(
            "SELECT pg_replication_slot_advance(slot_name, '{}') FROM pg_replication_slots \
             WHERE slot_name = '{}' AND NOT active AND (restart_lsn IS NULL OR restart_lsn < '{}')",
            lsn, name, lsn
        );
        self.psql(namespace, pod, "postgres", &query).await.map(|_| ())
    }

    async fn list_extensions(
        &self,
        namespace: &str,
        pod: &str,
        database: &str,
    ) -> Result<Vec<InstalledExtension>> {
        let output = self
            .psql(
                namespace,
                pod,
                database,
                "SELECT extname, extversion FROM pg_extension ORDER BY extname",
            )
            .await?;
        Ok(parse_extensions(&output))
    }

    async fn create_extension(
        &self,
        namespace: &str,
        pod: &str,
        database: &str,
        extension: &ExtensionSpec,
    ) -> Result<()> {
        let query = create_extension_sql(extension);
        self.psql(namespace, pod, database, &query).await.map(|_| ())
    }

    async fn start_backup(&self, namespace: &str, pod: &str, request: &BackupRequest) -> Result<()> {
        let script = format!(
            "nohup {} > /tmp/backup-{}.log 2>&1 &",
            barman_backup_command(request).join(" "),
            request.name
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        self.exec(namespace, pod, command).await.map(|_| ())
    }
}

/// barman-cloud-backup argument vector
pub fn barman_backup_command(request: &BackupRequest) -> Vec<String> {
    let mut args = vec![
        "barman-cloud-backup".to_string(),
        "--name".to_string(),
        shell_quote(&request.name),
        "--cloud-provider".to_string(),
        "aws-s3".to_string(),
    ];
    if let Some(endpoint) = &request.endpoint_url {
        args.push("--endpoint-url".to_string());
        args.push(shell_quote(endpoint));
    }
    args.push(shell_quote(&request.destination_path));
    args.push(shell_quote(&request.server_name));
    args
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Slot names are restricted to lower-case letters, digits and underscores
pub fn validate_slot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "invalid replication slot name '{}'",
            name
        )))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn create_extension_sql(extension: &ExtensionSpec) -> String {
    match &extension.version {
        Some(version) => format!(
            "CREATE EXTENSION IF NOT EXISTS {} VERSION {}",
            quote_ident(&extension.name),
            quote_literal(version)
        ),
        None => format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(&extension.name)),
    }
}

fn non_empty(field: &str) -> Option<&str> {
    let field = field.trim();
    if field.is_empty() { None } else { Some(field) }
}

/// Parse the single row returned by the status query
pub fn parse_instance_status(output: &str) -> Option<InstanceStatus> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split(',').collect();
    let [in_recovery, timeline, receive, replay, current, receivers] = fields.as_slice() else {
        return None;
    };

    Some(InstanceStatus {
        is_primary: in_recovery.trim() == "f",
        timeline: non_empty(timeline).and_then(|t| t.parse().ok()),
        receive_lsn: non_empty(receive).and_then(|l| l.parse().ok()),
        replay_lsn: non_empty(replay).and_then(|l| l.parse().ok()),
        current_lsn: non_empty(current).and_then(|l| l.parse().ok()),
        wal_receiver_active: receivers.trim().parse::<u32>().map(|n| n > 0).unwrap_or(false),
    })
}

/// Parse `df -B1 --output=size,used,avail`
pub fn parse_df_output(output: &str) -> Option<VolumeUsage> {
    let line = output.lines().skip(1).find(|l| !l.trim().is_empty())?;
    let mut parts = line.split_whitespace().map(|p| p.parse::<u64>());
    let total_bytes = parts.next()?.ok()?;
    let used_bytes = parts.next()?.ok()?;
    let available_bytes = parts.next()?.ok()?;
    Some(VolumeUsage {
        total_bytes,
        used_bytes,
        available_bytes,
    })
}

pub fn parse_wal_health(output: &str) -> Option<WalHealth> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let (pending, failing) = line.split_once(',')?;
    Some(WalHealth {
        archive_healthy: failing.trim() != "t",
        pending_wal_files: pending.trim().parse().ok()?,
        inactive_slots: Vec::new(),
    })
}

pub fn parse_inactive_slots(output: &str) -> Vec<InactiveSlot> {
    output
        .lines()
        .filter_map(|line| {
            let (name, bytes) = line.split_once(',')?;
            Some(InactiveSlot {
                name: non_empty(name)?.to_string(),
                retained_bytes: bytes.trim().parse().ok()?,
            })
        })
        .collect()
}

pub fn parse_replication_slots(output: &str) -> Vec<ReplicationSlot> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',');
            let name = non_empty(fields.next()?)?.to_string();
            let active = fields.next()?.trim() == "t";
            let restart_lsn = fields.next().and_then(non_empty).and_then(|l| l.parse().ok());
            Some(ReplicationSlot {
                name,
                active,
                restart_lsn,
            })
        })
        .collect()
}

pub fn parse_extensions(output: &str) -> Vec<InstalledExtension> {
    output
        .lines()
        .filter_map(|line| {
            let (name, version) = line.split_once(',')?;
            Some(InstalledExtension {
                name: non_empty(name)?.to_string(),
                version: version.trim().to_string(),
            })
        })
        .collect()
}
