//! Reconciliation of Backup objects
//!
//! A backup moves `New -> Running -> Completed | Failed`. The base backup is
//! started detached in the chosen instance pod; completion is read back from
//! the object store, so a restarted operator picks up running backups.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::fencing::FencedInstances;
use crate::controller::registry::{InstanceRegistry, pod_is_evicted};
use crate::controller::status::update_status;
use crate::crd::{Backup, BackupPhase, BackupStatus, BackupTarget, PostgresCluster};
use crate::objectstore::{BackupCatalog, BackupInfo, BarmanLocation, ObjectStore};
use crate::postgres::{BackupRequest, POSTGRES_CONTAINER};
use crate::resources::common::{ANNOTATION_FENCED_INSTANCES, FIELD_MANAGER, cluster_label_selector};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[instrument(skip(backup, ctx), fields(backup = %backup.name_any(), namespace = backup.namespace().unwrap_or_default()))]
pub async fn reconcile_backup(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action> {
    let ns = backup.namespace().unwrap_or_default();
    let status = backup.status.clone().unwrap_or_default();
    if status.phase.is_terminal() {
        return Ok(Action::await_change());
    }

    let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(cluster) = clusters.get_opt(&backup.spec.cluster.name).await? else {
        warn!(cluster = %backup.spec.cluster.name, "backup references a missing cluster");
        return Ok(Action::requeue(Duration::from_secs(30)));
    };
    let Some(config) = cluster.spec.backup.as_ref() else {
        return fail(&backup, &ctx, &ns, "cluster has no backup configuration").await;
    };
    let location = BarmanLocation::new(&config.barman_object_store, &cluster.name_any())?;

    match status.phase {
        BackupPhase::New => start(&backup, &cluster, &ctx, &ns, &location).await,
        BackupPhase::Running => {
            let store = ctx.object_stores.open(&ns, &config.barman_object_store).await?;
            poll(&backup, &cluster, &ctx, &ns, store.as_ref(), &location).await
        }
        BackupPhase::Completed | BackupPhase::Failed => Ok(Action::await_change()),
    }
}

pub fn backup_error_policy(backup: Arc<Backup>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(backup = %backup.name_any(), error = %error, "backup reconciliation failed, requeuing in {:?}", delay);
    Action::requeue(delay)
}

/// Instance that should run the backup
///
/// `PreferStandby` takes the lowest-serial healthy, unfenced standby and
/// falls back to the primary.
pub fn select_backup_target(
    registry: &InstanceRegistry,
    primary: Option<&str>,
    fenced: &FencedInstances,
    target: BackupTarget,
) -> Option<String> {
    let usable = |name: &str| registry.get(name).is_some_and(|i| i.is_healthy()) && !fenced.is_fenced(name);
    if target == BackupTarget::PreferStandby
        && let Some(standby) = registry
            .standbys(primary)
            .find(|i| i.is_healthy() && !fenced.is_fenced(&i.name))
    {
        return Some(standby.name.clone());
    }
    primary.filter(|p| usable(p)).map(str::to_string)
}

async fn start(
    backup: &Backup,
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    location: &BarmanLocation,
) -> Result<Action> {
    let cluster_name = cluster.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let pod_list = pods
        .list(&ListParams::default().labels(&cluster_label_selector(&cluster_name)))
        .await?;
    let registry = InstanceRegistry::from_objects(&cluster_name, &pod_list.items, &[], &[], &[]);
    let fenced = FencedInstances::parse(
        cluster
            .annotations()
            .get(ANNOTATION_FENCED_INSTANCES)
            .map(String::as_str),
    )?;
    let primary = cluster.status.as_ref().and_then(|s| s.current_primary.as_deref());
    let target = backup
        .spec
        .target
        .or(cluster.spec.backup.as_ref().map(|b| b.target))
        .unwrap_or_default();

    let Some(instance) = select_backup_target(&registry, primary, &fenced, target) else {
        debug!("no instance available for backup yet");
        return Ok(Action::requeue(POLL_INTERVAL));
    };

    let request = BackupRequest {
        name: backup.name_any(),
        destination_path: location.destination_path.clone(),
        server_name: location.server_name.clone(),
        endpoint_url: cluster
            .spec
            .backup
            .as_ref()
            .and_then(|b| b.barman_object_store.endpoint_url.clone()),
    };
    ctx.instances.start_backup(ns, &instance, &request).await?;
    info!(instance = %instance, "base backup started");

    let status = BackupStatus {
        phase: BackupPhase::Running,
        instance: Some(instance.clone()),
        destination_path: Some(location.destination_path.clone()),
        server_name: Some(location.server_name.clone()),
        started_at: Some(Utc::now().to_rfc3339()),
        ..Default::default()
    };
    patch_backup_status(ctx, ns, &backup.name_any(), &status).await?;
    if let Some(metrics) = ctx.metrics() {
        metrics.record_backup(&BackupPhase::Running.to_string());
    }
    ctx.publish_normal_event(backup, "BackupStarted", "StartBackup", Some(format!("Started on {}", instance)))
        .await;
    Ok(Action::requeue(POLL_INTERVAL))
}

/// State of a running backup as seen in the object store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    Pending,
    Completed(BackupInfo),
    Failed(String),
}

/// Look up a backup by name; DONE only counts once `data.tar` is uploaded
pub async fn backup_outcome(
    store: &dyn ObjectStore,
    location: &BarmanLocation,
    catalog: &BackupCatalog,
    name: &str,
) -> Result<BackupOutcome> {
    let Some(info) = catalog.find_by_name(name) else {
        return Ok(BackupOutcome::Pending);
    };
    if info.is_failed() {
        return Ok(BackupOutcome::Failed(
            info.error.clone().unwrap_or_else(|| "barman-cloud-backup failed".to_string()),
        ));
    }
    if !info.is_done() {
        return Ok(BackupOutcome::Pending);
    }
    let data_key = location.data_tar_key(&info.id);
    let uploaded = store.list(&data_key).await?.iter().any(|k| *k == data_key);
    Ok(if uploaded {
        BackupOutcome::Completed(info.clone())
    } else {
        BackupOutcome::Pending
    })
}

/// Why a running backup can no longer finish
///
/// The backup process lives in the target pod, so it is lost when the pod
/// is gone, evicted, deleted or restarted after the backup started. A
/// backup still running past `timeout` is also given up.
pub fn stalled_backup_reason(
    status: &BackupStatus,
    pod: Option<&Pod>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Option<String> {
    let instance = status.instance.as_deref().unwrap_or("<unknown>");
    let started = status
        .started_at
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    if let Some(started) = started
        && (now - started).to_std().is_ok_and(|running| running > timeout)
    {
        return Some(format!("backup did not finish within {}s", timeout.as_secs()));
    }

    let Some(pod) = pod else {
        return Some(format!("instance {} no longer exists", instance));
    };
    if pod_is_evicted(pod) {
        return Some(format!("instance {} was evicted", instance));
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return Some(format!("instance {} is being deleted", instance));
    }

    let started = started?;
    let after_start = |t: &Time| DateTime::<Utc>::from_timestamp(t.0.as_second(), 0).is_some_and(|t| t > started);
    if pod.metadata.creation_timestamp.as_ref().is_some_and(after_start) {
        return Some(format!("instance {} was recreated after the backup started", instance));
    }
    let restarted = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.name == POSTGRES_CONTAINER)
        .filter_map(|c| c.state.as_ref()?.running.as_ref()?.started_at.as_ref())
        .any(after_start);
    if restarted {
        return Some(format!("instance {} restarted after the backup started", instance));
    }
    None
}

async fn poll(
    backup: &Backup,
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    store: &dyn ObjectStore,
    location: &BarmanLocation,
) -> Result<Action> {
    let name = backup.name_any();
    let catalog = BackupCatalog::load(store, location).await?;

    match backup_outcome(store, location, &catalog, &name).await? {
        BackupOutcome::Pending => {
            let status = backup.status.clone().unwrap_or_default();
            let pod = match status.instance.as_deref() {
                Some(instance) => Api::<Pod>::namespaced(ctx.client.clone(), ns).get_opt(instance).await?,
                None => None,
            };
            match stalled_backup_reason(&status, pod.as_ref(), Utc::now(), ctx.config.backup_timeout()) {
                Some(reason) => fail(backup, ctx, ns, &reason).await,
                None => Ok(Action::requeue(POLL_INTERVAL)),
            }
        }
        BackupOutcome::Failed(message) => fail(backup, ctx, ns, &message).await,
        BackupOutcome::Completed(info) => {
            let mut status = backup.status.clone().unwrap_or_default();
            status.phase = BackupPhase::Completed;
            status.backup_id = Some(info.id.clone());
            status.begin_wal = info.begin_wal.clone();
            status.end_wal = info.end_wal.clone();
            status.begin_lsn = info.begin_lsn.clone();
            status.end_lsn = info.end_lsn.clone();
            status.timeline_id = info.timeline;
            status.stopped_at = info.end_time.map(|t| t.to_rfc3339());
            patch_backup_status(ctx, ns, &name, &status).await?;

            let first = catalog.first_recoverability_point().map(|t| t.to_rfc3339());
            let last = info.end_time.map(|t| t.to_rfc3339());
            update_status(
                ctx.status_store.as_ref(),
                ns,
                &cluster.name_any(),
                ctx.config.status_update_retries,
                |s| {
                    if first.is_some() {
                        s.first_recoverability_point = first.clone();
                    }
                    if last.is_some() && s.last_successful_backup < last {
                        s.last_successful_backup = last.clone();
                    }
                    Ok(())
                },
            )
            .await?;

            if let Some(metrics) = ctx.metrics() {
                metrics.record_backup(&BackupPhase::Completed.to_string());
            }
            info!(backup_id = %info.id, "backup completed");
            ctx.publish_normal_event(backup, "BackupCompleted", "CompleteBackup", Some(info.id))
                .await;
            Ok(Action::await_change())
        }
    }
}

async fn fail(backup: &Backup, ctx: &Context, ns: &str, message: &str) -> Result<Action> {
    let mut status = backup.status.clone().unwrap_or_default();
    status.phase = BackupPhase::Failed;
    status.error = Some(message.to_string());
    status.stopped_at = Some(Utc::now().to_rfc3339());
    patch_backup_status(ctx, ns, &backup.name_any(), &status).await?;
    if let Some(metrics) = ctx.metrics() {
        metrics.record_backup(&BackupPhase::Failed.to_string());
    }
    warn!(error = %message, "backup failed");
    ctx.publish_warning_event(backup, "BackupFailed", "CompleteBackup", Some(message.to_string()))
        .await;
    Ok(Action::await_change())
}

async fn patch_backup_status(ctx: &Context, ns: &str, name: &str, status: &BackupStatus) -> Result<()> {
    let api: Api<Backup> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
