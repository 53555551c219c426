//! Commands behind the `kubectl-pgha` plugin
//!
//! Each command talks to the API server directly. Status changes go
//! through the same compare-and-swap path the reconciler uses, so a
//! promote racing the operator retries instead of losing an update.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

use crate::controller::error::{Error, Result};
use crate::controller::fencing::FencedInstances;
use crate::controller::registry::pod_is_ready;
use crate::controller::status::{KubeStatusStore, update_status};
use crate::crd::{
    Backup, BackupSpec, LocalObjectReference, PENDING_FAILOVER_MARKER, PostgresCluster, PostgresClusterStatus, PromotionKind, PromotionStatus,
};
use crate::resources::common::{ANNOTATION_FENCED_INSTANCES, FIELD_MANAGER, LABEL_BACKUP_CLUSTER};

const STATUS_RETRIES: u32 = 5;

/// Check that `target` can take over as primary
pub fn check_promotable(cluster: &PostgresCluster, pod: Option<&Pod>, target: &str) -> Result<()> {
    let Some(pod) = pod else {
        return Err(Error::ValidationError(format!("instance {} does not exist", target)));
    };
    if !pod_is_ready(pod) {
        return Err(Error::ValidationError(format!("instance {} is not ready", target)));
    }
    let fenced = FencedInstances::parse(cluster.annotations().get(ANNOTATION_FENCED_INSTANCES).map(String::as_str))?;
    if fenced.is_fenced(target) {
        return Err(Error::ValidationError(format!("instance {} is fenced", target)));
    }
    Ok(())
}

/// Status mutation for a promote request
///
/// Returns false when `target` already is the primary. A pending failover
/// election cannot be overridden; a switchover to another instance can,
/// the newest request wins.
pub fn apply_promotion(status: &mut PostgresClusterStatus, target: &str, now: DateTime<Utc>) -> Result<bool> {
    if status.target_primary.as_deref() == Some(PENDING_FAILOVER_MARKER) {
        return Err(Error::TransientError(
            "a failover is in progress, retry once a primary has been elected".to_string(),
        ));
    }
    if status.current_primary.as_deref() == Some(target) && !status.promotion_in_progress() {
        return Ok(false);
    }
    status.target_primary = Some(target.to_string());
    status.promotion = Some(PromotionStatus {
        kind: PromotionKind::Switchover,
        from: status.current_primary.clone(),
        requested_at: now.to_rfc3339(),
        reason: "requested by kubectl-pgha promote".to_string(),
    });
    Ok(true)
}

/// Make `target` the primary of `cluster`
pub async fn promote(client: Client, namespace: &str, cluster_name: &str, target: &str) -> Result<bool> {
    let clusters: Api<PostgresCluster> = Api::namespaced(client.clone(), namespace);
    let cluster = clusters.get(cluster_name).await?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get_opt(target).await?;
    check_promotable(&cluster, pod.as_ref(), target)?;

    let store = KubeStatusStore::new(client);
    let mut changed = false;
    update_status(&store, namespace, cluster_name, STATUS_RETRIES, |status| {
        changed = apply_promotion(status, target, Utc::now())?;
        Ok(())
    })
    .await?;
    Ok(changed)
}

/// Fence or unfence one instance, or `*` for all of them
///
/// Returns the new annotation value, or None when nothing changed.
pub fn toggle_fence(annotation: Option<&str>, instance: &str, fence: bool) -> Result<Option<String>> {
    let mut fenced = FencedInstances::parse(annotation)?;
    let changed = if fence {
        if instance == crate::controller::fencing::FENCE_ALL {
            let changed = !fenced.is_all();
            fenced = FencedInstances::all();
            changed
        } else {
            fenced.fence(instance)
        }
    } else {
        fenced.unfence(instance)?
    };
    Ok(changed.then(|| fenced.to_annotation()))
}

pub async fn fence(client: Client, namespace: &str, cluster_name: &str, instance: &str, on: bool) -> Result<bool> {
    let clusters: Api<PostgresCluster> = Api::namespaced(client, namespace);
    let cluster = clusters.get(cluster_name).await?;
    let current = cluster.annotations().get(ANNOTATION_FENCED_INSTANCES).map(String::as_str);

    let Some(annotation) = toggle_fence(current, instance, on)? else {
        return Ok(false);
    };
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_FENCED_INSTANCES: annotation,
            }
        }
    });
    clusters
        .patch(cluster_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Human readable summary of a cluster and its instances
pub fn render_status(cluster: &PostgresCluster, pods: &[Pod]) -> String {
    let status = cluster.status.clone().unwrap_or_default();
    let mut out = String::new();

    let _ = writeln!(out, "Cluster:         {}", cluster.name_any());
    let _ = writeln!(out, "Phase:           {}", status.phase);
    if let Some(reason) = &status.phase_reason {
        let _ = writeln!(out, "Reason:          {}", reason);
    }
    let _ = writeln!(out, "Primary:         {}", status.current_primary.as_deref().unwrap_or("-"));
    if status.promotion_in_progress() {
        let _ = writeln!(out, "Target primary:  {}", status.target_primary.as_deref().unwrap_or("-"));
    }
    let _ = writeln!(out, "Instances:       {}/{} ready", status.ready_instances, cluster.spec.instances);
    if let Some(timeline) = status.timeline_id {
        let _ = writeln!(out, "Timeline:        {}", timeline);
    }
    if let Some(backup) = &status.last_successful_backup {
        let _ = writeln!(out, "Last backup:     {}", backup);
    }
    if !status.fenced_instances.is_empty() {
        let _ = writeln!(out, "Fenced:          {}", status.fenced_instances.join(", "));
    }
    if !status.ha_replication_slots.is_empty() {
        let _ = writeln!(out, "HA slots:        {}", status.ha_replication_slots.join(", "));
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{:<24} {:<8} {:<6} {}", "INSTANCE", "ROLE", "READY", "NODE");
    let fenced = &status.fenced_instances;
    let mut pods: Vec<&Pod> = pods.iter().collect();
    pods.sort_by_key(|p| p.name_any());
    for pod in pods {
        let name = pod.name_any();
        let role = if status.current_primary.as_deref() == Some(name.as_str()) {
            "primary"
        } else {
            "replica"
        };
        let ready = if pod_is_ready(pod) { "yes" } else { "no" };
        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or("-");
        let marker = if fenced.iter().any(|f| f == "*" || *f == name) {
            " (fenced)"
        } else {
            ""
        };
        let _ = writeln!(out, "{:<24} {:<8} {:<6} {}{}", name, role, ready, node, marker);
    }
    out
}

pub async fn status(client: Client, namespace: &str, cluster_name: &str) -> Result<String> {
    let clusters: Api<PostgresCluster> = Api::namespaced(client.clone(), namespace);
    let cluster = clusters.get(cluster_name).await?;
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let selector = crate::resources::common::cluster_label_selector(cluster_name);
    let pods = pods.list(&kube::api::ListParams::default().labels(&selector)).await?;
    Ok(render_status(&cluster, &pods.items))
}

/// On-demand Backup object for `cluster_name`
pub fn backup_request(cluster_name: &str, name: Option<&str>, now: DateTime<Utc>) -> Backup {
    let name = name
        .map(String::from)
        .unwrap_or_else(|| format!("{}-{}", cluster_name, now.format("%Y%m%d%H%M%S")));
    let mut backup = Backup::new(
        &name,
        BackupSpec {
            cluster: LocalObjectReference {
                name: cluster_name.to_string(),
            },
            target: None,
        },
    );
    backup
        .labels_mut()
        .insert(LABEL_BACKUP_CLUSTER.to_string(), cluster_name.to_string());
    backup
}

pub async fn backup(client: Client, namespace: &str, cluster_name: &str, name: Option<&str>) -> Result<String> {
    let clusters: Api<PostgresCluster> = Api::namespaced(client.clone(), namespace);
    clusters.get(cluster_name).await?;

    let backups: Api<Backup> = Api::namespaced(client, namespace);
    let created = backups
        .create(&PostParams::default(), &backup_request(cluster_name, name, Utc::now()))
        .await?;
    Ok(created.name_any())
}
