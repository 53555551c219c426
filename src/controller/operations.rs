//! Side effects of a reconcile pass
//!
//! The planners decide; these functions carry the decision out against the
//! API server or an instance and record it in status.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::fencing::{FencedInstances, is_disk_exhausted};
use crate::controller::instances::InstanceAction;
use crate::controller::registry::InstanceRegistry;
use crate::controller::resize::{
    AutoResizeDecision, AutoResizeInput, PvcObservation, evaluate_auto_resize, plan_pvc, size_for_new_pvc,
};
use crate::controller::slots::{plan_slot_changes, plan_standby_slots};
use crate::controller::status::update_status;
use crate::controller::topology::TopologyAction;
use crate::crd::{
    AutoResizeEvent, PENDING_FAILOVER_MARKER, PostgresCluster, PromotionKind, PromotionStatus, PvcRole,
    ResizeState, VolumeResizeStatus,
};
use crate::postgres::{InstanceClient, PGDATA_MOUNT, PGWAL_MOUNT, ReplicationSlot, WalHealth};
use crate::resources::certificate::{CERT_MANAGER_GROUP, CERT_MANAGER_VERSION, CERTIFICATE_KIND, Certificate};
use crate::resources::common::{ANNOTATION_FENCED_INSTANCES, FIELD_MANAGER, LABEL_FENCED, LABEL_INSTANCE_ROLE, role_label};
use crate::resources::inheritance::InheritedMetadata;
use crate::resources::instance::{BootstrapMode, InstanceParams, generate_instance_pod, instance_name};
use crate::resources::pvc::{
    CONDITION_FS_RESIZE_PENDING, CONDITION_RESIZING, capacity_bytes, cluster_pvc_roles, generate_pvc,
    has_condition, pvc_instance, pvc_role, requested_bytes, storage_for,
};
use crate::resources::quantity::{format_quantity, parse_quantity};

/// Apply a namespaced object with server-side apply
pub async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(resource))
        .await?;
    debug!(resource = %name, "applied");
    Ok(())
}

/// Create an object, treating `AlreadyExists` as success
pub async fn create_if_missing<T>(ctx: &Context, ns: &str, resource: &T) -> Result<bool>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignoring_missing<T>(ctx: &Context, ns: &str, name: &str) -> Result<()>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply a cert-manager Certificate
pub async fn apply_certificate(ctx: &Context, ns: &str, certificate: &Certificate) -> Result<()> {
    let gvk = GroupVersionKind::gvk(CERT_MANAGER_GROUP, CERT_MANAGER_VERSION, CERTIFICATE_KIND);
    let resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), ns, &resource);
    let name = certificate.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&serde_json::to_value(certificate)?),
    )
    .await?;
    debug!(certificate = %name, "applied");
    Ok(())
}

/// Write the fence set back to the cluster annotation
pub async fn patch_fence_annotation(ctx: &Context, cluster: &PostgresCluster, fenced: &FencedInstances) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &cluster.namespace().unwrap_or_default());
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_FENCED_INSTANCES: fenced.to_annotation()
            }
        }
    });
    api.patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Instances whose WAL volume ran out of space
///
/// Only pods that are not ready are checked; an instance whose usage cannot
/// be read is skipped for this pass.
pub async fn find_exhausted_instances(
    instances: &dyn InstanceClient,
    ns: &str,
    registry: &InstanceRegistry,
    mount: &str,
) -> BTreeSet<String> {
    let mut exhausted = BTreeSet::new();
    for instance in registry.iter().filter(|i| !i.ready && !i.deleting && !i.evicted) {
        match instances.volume_usage(ns, &instance.name, mount).await {
            Ok(usage) if is_disk_exhausted(instance.ready, &usage) => {
                exhausted.insert(instance.name.clone());
            }
            Ok(_) => {}
            Err(e) => debug!(instance = %instance.name, error = %e, "volume usage unavailable"),
        }
    }
    exhausted
}

/// Carry out a topology step; returns a delay when the step is a wait
pub async fn apply_topology(
    ctx: &Context,
    cluster: &PostgresCluster,
    action: &TopologyAction,
    now: DateTime<Utc>,
) -> Result<Option<std::time::Duration>> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let store = ctx.status_store.as_ref();
    let retries = ctx.config.status_update_retries;
    let stamp = now.to_rfc3339();

    match action {
        TopologyAction::Steady | TopologyAction::WaitForBootstrap => Ok(None),
        TopologyAction::AdoptPrimary { instance } => {
            info!(instance = %instance, "first instance is primary");
            update_status(store, &ns, &name, retries, |s| {
                s.current_primary = Some(instance.clone());
                s.target_primary = Some(instance.clone());
                s.promotion = None;
                Ok(())
            })
            .await?;
            Ok(None)
        }
        TopologyAction::MarkPrimaryFailing => {
            update_status(store, &ns, &name, retries, |s| {
                if s.primary_failing_since.is_none() {
                    s.primary_failing_since = Some(stamp.clone());
                }
                Ok(())
            })
            .await?;
            Ok(Some(std::time::Duration::from_secs(1)))
        }
        TopologyAction::ClearPrimaryFailing => {
            update_status(store, &ns, &name, retries, |s| {
                s.primary_failing_since = None;
                s.fence_lifted_at = None;
                Ok(())
            })
            .await?;
            Ok(None)
        }
        TopologyAction::MarkFenceLifted { instance } => {
            info!(instance = %instance, "fence lifted, waiting for the primary to restart");
            update_status(store, &ns, &name, retries, |s| {
                if s.fence_lifted_at.is_none() {
                    s.fence_lifted_at = Some(stamp.clone());
                }
                s.primary_failing_since = None;
                Ok(())
            })
            .await?;
            Ok(Some(std::time::Duration::from_secs(5)))
        }
        TopologyAction::AwaitFencedPrimary { instance, remaining } => {
            debug!(instance = %instance, ?remaining, "primary still restarting after fence");
            Ok(Some((*remaining).min(std::time::Duration::from_secs(10))))
        }
        TopologyAction::AwaitFailoverDelay { remaining } => Ok(Some(*remaining)),
        TopologyAction::BeginFailover { from, reason } => {
            warn!(primary = %from, reason = %reason, "starting failover");
            update_status(store, &ns, &name, retries, |s| {
                s.target_primary = Some(PENDING_FAILOVER_MARKER.to_string());
                s.promotion = Some(PromotionStatus {
                    kind: PromotionKind::Failover,
                    from: Some(from.clone()),
                    requested_at: stamp.clone(),
                    reason: reason.clone(),
                });
                Ok(())
            })
            .await?;
            if let Some(metrics) = ctx.metrics() {
                metrics.record_failover(&ns, &name);
            }
            ctx.publish_warning_event(cluster, "FailoverStarted", "Failover", Some(reason.clone()))
                .await;
            Ok(Some(std::time::Duration::from_secs(1)))
        }
        TopologyAction::WaitForWalReceivers { instances } => {
            debug!(?instances, "waiting for standbys to finish receiving WAL");
            Ok(Some(std::time::Duration::from_secs(2)))
        }
        TopologyAction::ElectPrimary { instance, replay_lsn } => {
            info!(instance = %instance, replay_lsn = ?replay_lsn, "elected failover target");
            update_status(store, &ns, &name, retries, |s| {
                if s.target_primary.as_deref() == Some(PENDING_FAILOVER_MARKER) {
                    s.target_primary = Some(instance.clone());
                }
                Ok(())
            })
            .await?;
            Ok(Some(std::time::Duration::from_secs(1)))
        }
        TopologyAction::CancelFailover => {
            info!("primary recovered before a standby was elected");
            update_status(store, &ns, &name, retries, |s| {
                s.target_primary = s.current_primary.clone();
                s.promotion = None;
                s.primary_failing_since = None;
                s.fence_lifted_at = None;
                Ok(())
            })
            .await?;
            Ok(None)
        }
        TopologyAction::NoEligibleStandby { reason } => {
            ctx.publish_warning_event(cluster, "NoEligibleStandby", "Failover", Some(reason.clone()))
                .await;
            Ok(Some(std::time::Duration::from_secs(5)))
        }
        TopologyAction::BeginSwitchover { target, reason } => {
            info!(target = %target, reason = %reason, "starting switchover");
            begin_switchover(ctx, cluster, target, reason, now).await?;
            Ok(Some(std::time::Duration::from_secs(1)))
        }
        TopologyAction::Demote { instance } => {
            info!(instance = %instance, "demoting old primary");
            ctx.instances.demote(&ns, instance).await?;
            Ok(Some(std::time::Duration::from_secs(2)))
        }
        TopologyAction::Promote { instance } => {
            info!(instance = %instance, "promoting");
            ctx.instances.promote(&ns, instance).await?;
            Ok(Some(std::time::Duration::from_secs(2)))
        }
        TopologyAction::CompletePromotion { instance, timeline } => {
            info!(instance = %instance, timeline = ?timeline, "promotion complete");
            update_status(store, &ns, &name, retries, |s| {
                s.current_primary = Some(instance.clone());
                s.target_primary = Some(instance.clone());
                s.promotion = None;
                s.primary_failing_since = None;
                s.fence_lifted_at = None;
                if timeline.is_some() {
                    s.timeline_id = *timeline;
                }
                Ok(())
            })
            .await?;
            ctx.publish_normal_event(cluster, "PrimaryChanged", "Promote", Some(format!("{} is now primary", instance)))
                .await;
            Ok(None)
        }
        TopologyAction::AbortSwitchover { reason } => {
            warn!(reason = %reason, "aborting switchover");
            update_status(store, &ns, &name, retries, |s| {
                s.target_primary = s.current_primary.clone();
                s.promotion = None;
                Ok(())
            })
            .await?;
            ctx.publish_warning_event(cluster, "SwitchoverAborted", "Switchover", Some(reason.clone()))
                .await;
            Ok(None)
        }
        TopologyAction::RestartElection { reason } => {
            warn!(reason = %reason, "re-running failover election");
            update_status(store, &ns, &name, retries, |s| {
                s.target_primary = Some(PENDING_FAILOVER_MARKER.to_string());
                if let Some(promotion) = s.promotion.as_mut() {
                    promotion.requested_at = stamp.clone();
                }
                Ok(())
            })
            .await?;
            Ok(Some(std::time::Duration::from_secs(1)))
        }
    }
}

/// Record a planned promotion; the topology planner drives it from here
pub async fn begin_switchover(
    ctx: &Context,
    cluster: &PostgresCluster,
    target: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    update_status(ctx.status_store.as_ref(), &ns, &name, ctx.config.status_update_retries, |s| {
        if s.promotion_in_progress() {
            return Err(Error::TransientError("a promotion is already in progress".to_string()));
        }
        s.target_primary = Some(target.to_string());
        s.promotion = Some(PromotionStatus {
            kind: PromotionKind::Switchover,
            from: s.current_primary.clone(),
            requested_at: now.to_rfc3339(),
            reason: reason.to_string(),
        });
        Ok(())
    })
    .await?;
    if let Some(metrics) = ctx.metrics() {
        metrics.record_switchover(&ns, &name);
    }
    ctx.publish_normal_event(cluster, "SwitchoverStarted", "Switchover", Some(reason.to_string()))
        .await;
    Ok(())
}

/// What a new or recreated instance pod is built from
pub struct InstanceSetup<'a> {
    pub primary: Option<&'a str>,
    /// Bootstrap of the first instance; initdb when unset
    pub first_bootstrap: Option<BootstrapMode>,
    pub fenced: &'a FencedInstances,
    pub inherited: &'a InheritedMetadata,
    pub certificates: &'a BTreeMap<String, String>,
    pub pvcs: &'a [PersistentVolumeClaim],
}

/// Carry out an instance lifecycle step
pub async fn apply_instance_action(
    ctx: &Context,
    cluster: &PostgresCluster,
    registry: &InstanceRegistry,
    action: &InstanceAction,
    setup: InstanceSetup<'_>,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let InstanceSetup {
        primary,
        first_bootstrap,
        fenced,
        inherited,
        certificates,
        pvcs,
    } = setup;

    match action {
        InstanceAction::None | InstanceAction::Wait { .. } => Ok(()),
        InstanceAction::Create { serial, first } => {
            let instance = instance_name(&cluster_name, *serial);
            for role in cluster_pvc_roles(cluster) {
                let Some(storage) = storage_for(cluster, role) else {
                    continue;
                };
                let spec_size = parse_quantity(&storage.size)?;
                let existing = pvcs
                    .iter()
                    .filter(|p| pvc_role(p) == Some(role))
                    .filter_map(|p| requested_bytes(p).ok().flatten());
                let size = size_for_new_pvc(spec_size, existing);
                create_if_missing(ctx, &ns, &generate_pvc(cluster, &instance, role, size, inherited)).await?;
            }

            let bootstrap = if *first {
                first_bootstrap.unwrap_or(BootstrapMode::Initdb)
            } else {
                BootstrapMode::Join
            };
            let mode = bootstrap.as_str();
            let pod = generate_instance_pod(
                cluster,
                &InstanceParams {
                    serial: *serial,
                    is_primary: *first,
                    fenced: fenced.is_fenced(&instance),
                    bootstrap,
                    certificates,
                },
                inherited,
            );
            create_if_missing(ctx, &ns, &pod).await?;
            update_status(ctx.status_store.as_ref(), &ns, &cluster_name, ctx.config.status_update_retries, |s| {
                s.latest_generated_node = s.latest_generated_node.max(*serial);
                Ok(())
            })
            .await?;
            info!(instance = %instance, bootstrap = mode, "created instance");
            ctx.publish_normal_event(cluster, "InstanceCreated", "Create", Some(instance)).await;
            Ok(())
        }
        InstanceAction::Recreate { serial } => {
            let instance = instance_name(&cluster_name, *serial);
            let is_primary = primary == Some(instance.as_str());
            let pod = generate_instance_pod(
                cluster,
                &InstanceParams {
                    serial: *serial,
                    is_primary,
                    fenced: fenced.is_fenced(&instance),
                    bootstrap: BootstrapMode::Join,
                    certificates,
                },
                inherited,
            );
            create_if_missing(ctx, &ns, &pod).await?;
            info!(instance = %instance, "recreated instance on existing volumes");
            Ok(())
        }
        InstanceAction::DeleteEvicted { instance } => {
            info!(instance = %instance, "deleting evicted pod");
            delete_ignoring_missing::<Pod>(ctx, &ns, instance).await
        }
        InstanceAction::Restart { instance } => {
            info!(instance = %instance, "restarting onto the current image");
            delete_ignoring_missing::<Pod>(ctx, &ns, instance).await
        }
        InstanceAction::Remove { instance } => {
            info!(instance = %instance, "scaling down");
            delete_ignoring_missing::<Pod>(ctx, &ns, instance).await?;
            if let Some(found) = registry.get(instance) {
                for pvc in found.pvcs.values() {
                    delete_ignoring_missing::<PersistentVolumeClaim>(ctx, &ns, pvc).await?;
                }
            }
            ctx.publish_normal_event(cluster, "InstanceRemoved", "ScaleDown", Some(instance.clone()))
                .await;
            Ok(())
        }
        InstanceAction::SwitchoverForUpdate { target } => {
            begin_switchover(ctx, cluster, target, "rolling update of the primary", Utc::now()).await
        }
    }
}

/// Outcome of the storage pass
#[derive(Debug, Default)]
pub struct StorageOutcome {
    pub volumes: Vec<VolumeResizeStatus>,
    pub resize_events: Vec<AutoResizeEvent>,
}

impl StorageOutcome {
    pub fn resize_pending(&self) -> bool {
        self.volumes.iter().any(|v| v.state != ResizeState::UpToDate)
    }
}

fn observe_pvc(pvc: &PersistentVolumeClaim) -> Result<Option<PvcObservation>> {
    let (Some(role), Some(instance)) = (pvc_role(pvc), pvc_instance(pvc)) else {
        return Ok(None);
    };
    let Some(requested) = requested_bytes(pvc)? else {
        return Ok(None);
    };
    Ok(Some(PvcObservation {
        pvc_name: pvc.name_any(),
        instance: instance.to_string(),
        role,
        requested,
        capacity: capacity_bytes(pvc)?,
        resizing: has_condition(pvc, CONDITION_RESIZING),
        fs_resize_pending: has_condition(pvc, CONDITION_FS_RESIZE_PENDING),
    }))
}

async fn patch_pvc_request(ctx: &Context, ns: &str, pvc: &str, bytes: u64) -> Result<()> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({
        "spec": { "resources": { "requests": { "storage": format_quantity(bytes) } } }
    });
    api.patch(pvc, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Grow PVCs to the spec size and run auto-resize
pub async fn reconcile_storage(
    ctx: &Context,
    cluster: &PostgresCluster,
    registry: &InstanceRegistry,
    pvcs: &[PersistentVolumeClaim],
    primary: Option<&str>,
    history: &[AutoResizeEvent],
    now: DateTime<Utc>,
) -> Result<StorageOutcome> {
    let ns = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let single_volume = cluster.spec.wal_storage.is_none();

    let mut outcome = StorageOutcome::default();
    let mut history = history.to_vec();
    let mut wal_health: Option<Option<WalHealth>> = None;

    for pvc in pvcs {
        let Some(observed) = observe_pvc(pvc)? else {
            continue;
        };
        let Some(storage) = storage_for(cluster, observed.role) else {
            continue;
        };
        let spec_size = parse_quantity(&storage.size)?;
        let mut plan = plan_pvc(&observed, spec_size);

        if let Some(to) = plan.patch_to {
            info!(pvc = %observed.pvc_name, to = %format_quantity(to), "raising PVC request");
            patch_pvc_request(ctx, &ns, &observed.pvc_name, to).await?;
            if let Some(metrics) = ctx.metrics() {
                metrics.record_resize_request(&ns, &cluster_name, observed.role.as_label());
            }
        } else if plan.status.state == ResizeState::UpToDate
            && let Some(config) = storage.resize.as_ref().filter(|r| r.enabled)
            && registry.get(&observed.instance).is_some_and(|i| i.is_healthy())
        {
            let mount = if observed.role == PvcRole::Wal { PGWAL_MOUNT } else { PGDATA_MOUNT };
            let usage = match ctx.instances.volume_usage(&ns, &observed.instance, mount).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(pvc = %observed.pvc_name, error = %e, "volume usage unavailable");
                    outcome.volumes.push(plan.status);
                    continue;
                }
            };

            let holds_wal = observed.role == PvcRole::Wal || single_volume;
            if holds_wal && wal_health.is_none() {
                let source = primary.unwrap_or(&observed.instance);
                wal_health = Some(ctx.instances.wal_health(&ns, source).await.ok());
            }

            let decision = evaluate_auto_resize(&AutoResizeInput {
                pvc_name: &observed.pvc_name,
                role: observed.role,
                single_volume,
                config,
                usage: &usage,
                requested: observed.requested,
                history: &history,
                wal_health: wal_health.as_ref().and_then(Option::as_ref),
                now,
            })?;

            match decision {
                AutoResizeDecision::NotTriggered => {}
                AutoResizeDecision::Blocked(event) | AutoResizeDecision::AtLimit(event) => {
                    ctx.publish_warning_event(cluster, event.reason, "AutoResize", Some(event.message))
                        .await;
                }
                AutoResizeDecision::Resize { to, events } => {
                    patch_pvc_request(ctx, &ns, &observed.pvc_name, to).await?;
                    if let Some(metrics) = ctx.metrics() {
                        metrics.record_resize_request(&ns, &cluster_name, observed.role.as_label());
                    }
                    let record = AutoResizeEvent {
                        pvc_name: observed.pvc_name.clone(),
                        timestamp: now.to_rfc3339(),
                        from: format_quantity(observed.requested),
                        to: format_quantity(to),
                    };
                    history.push(record.clone());
                    outcome.resize_events.push(record);
                    for event in events {
                        if event.warning {
                            ctx.publish_warning_event(cluster, event.reason, "AutoResize", Some(event.message))
                                .await;
                        } else {
                            ctx.publish_normal_event(cluster, event.reason, "AutoResize", Some(event.message))
                                .await;
                        }
                    }
                    plan.status.requested = format_quantity(to);
                    plan.status.desired = format_quantity(to);
                    plan.status.state = ResizeState::Resizing;
                }
            }
        }

        outcome.volumes.push(plan.status);
    }

    Ok(outcome)
}

/// Converge HA replication slots on the primary; returns the slots kept
pub async fn reconcile_slots(
    ctx: &Context,
    cluster: &PostgresCluster,
    registry: &InstanceRegistry,
    primary: &str,
) -> Result<Vec<String>> {
    let ns = cluster.namespace().unwrap_or_default();
    let ha = &cluster.spec.replication_slots.high_availability;
    let observed = ctx
        .instances
        .list_replication_slots(&ns, primary, &ha.slot_prefix)
        .await?;

    let standbys = registry.standbys(Some(primary)).map(|i| i.name.as_str());
    let plan = plan_slot_changes(ha.enabled, &ha.slot_prefix, standbys, &observed);

    for slot in &plan.create {
        info!(slot = %slot, "creating HA replication slot");
        ctx.instances.create_replication_slot(&ns, primary, slot).await?;
    }
    for slot in &plan.drop {
        info!(slot = %slot, "dropping HA replication slot");
        ctx.instances.drop_replication_slot(&ns, primary, slot).await?;
    }
    if !plan.retry.is_empty() {
        debug!(slots = ?plan.retry, "slots still active, retrying later");
    }

    let dropped: BTreeSet<&String> = plan.drop.iter().collect();
    let mut kept: Vec<String> = observed
        .into_iter()
        .map(|s| s.name)
        .filter(|n| !dropped.contains(n))
        .chain(plan.create.iter().cloned())
        .collect();
    kept.sort();
    kept.dedup();
    Ok(kept)
}

/// Align HA slots on every ready standby with the primary's
///
/// Returns the slots kept on each standby that answered. A standby that
/// cannot be reached is skipped and retried on the next pass.
pub async fn reconcile_standby_slots(
    ctx: &Context,
    cluster: &PostgresCluster,
    registry: &InstanceRegistry,
    primary: &str,
) -> Result<BTreeMap<String, Vec<String>>> {
    let ns = cluster.namespace().unwrap_or_default();
    let ha = &cluster.spec.replication_slots.high_availability;
    let primary_slots = ctx
        .instances
        .list_replication_slots(&ns, primary, &ha.slot_prefix)
        .await?;

    let mut published = BTreeMap::new();
    for standby in registry.standbys(Some(primary)).filter(|i| i.is_healthy()) {
        match sync_standby_slots(ctx, &ns, cluster, &standby.name, &primary_slots).await {
            Ok(kept) => {
                published.insert(standby.name.clone(), kept);
            }
            Err(e) => warn!(instance = %standby.name, error = %e, "standby slot sync failed"),
        }
    }
    Ok(published)
}

async fn sync_standby_slots(
    ctx: &Context,
    ns: &str,
    cluster: &PostgresCluster,
    standby: &str,
    primary_slots: &[ReplicationSlot],
) -> Result<Vec<String>> {
    let ha = &cluster.spec.replication_slots.high_availability;
    let observed = ctx
        .instances
        .list_replication_slots(ns, standby, &ha.slot_prefix)
        .await?;
    let plan = plan_standby_slots(ha.enabled, &ha.slot_prefix, standby, primary_slots, &observed);

    for slot in &plan.create {
        debug!(instance = %standby, slot = %slot, "mirroring HA replication slot");
        ctx.instances.create_replication_slot(ns, standby, slot).await?;
    }
    for (slot, lsn) in &plan.advance {
        ctx.instances.advance_replication_slot(ns, standby, slot, *lsn).await?;
    }
    for slot in &plan.drop {
        info!(instance = %standby, slot = %slot, "dropping stale HA replication slot");
        ctx.instances.drop_replication_slot(ns, standby, slot).await?;
    }

    let dropped: BTreeSet<&String> = plan.drop.iter().collect();
    let mut kept: Vec<String> = observed
        .into_iter()
        .map(|s| s.name)
        .filter(|n| !dropped.contains(n))
        .chain(plan.create.iter().cloned())
        .collect();
    kept.sort();
    kept.dedup();
    Ok(kept)
}

/// Set role and fence labels on instance pods
pub async fn sync_role_labels(
    ctx: &Context,
    ns: &str,
    pods: &[Pod],
    primary: Option<&str>,
    fenced: &FencedInstances,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    for pod in pods {
        let name = pod.name_any();
        let role = role_label(Some(name.as_str()) == primary);
        let is_fenced = fenced.is_fenced(&name).to_string();
        let labels = pod.labels();
        if labels.get(LABEL_INSTANCE_ROLE).map(String::as_str) == Some(role)
            && labels.get(LABEL_FENCED) == Some(&is_fenced)
        {
            continue;
        }
        debug!(instance = %name, role, fenced = %is_fenced, "updating pod labels");
        let patch = json!({
            "metadata": { "labels": { LABEL_INSTANCE_ROLE: role, LABEL_FENCED: is_fenced } }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    }
    Ok(())
}
