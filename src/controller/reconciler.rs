//! Reconciliation logic for PostgresCluster resources
//!
//! Each pass observes pods, PVCs and nodes, then runs fencing, topology,
//! instance lifecycle, storage, replication slots and extensions in that
//! order. Independent steps write only their own status fields through the
//! CAS status store, so a pass that loses a race retries the write rather
//! than clobbering another writer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::extensions::reconcile_extensions;
use crate::controller::fencing::{FencedInstances, plan_fencing};
use crate::controller::instances::{InstanceAction, InstanceInput, plan_instances};
use crate::controller::operations::{
    InstanceSetup, apply_certificate, apply_instance_action, apply_resource, apply_topology,
    find_exhausted_instances, patch_fence_annotation, reconcile_slots, reconcile_standby_slots,
    reconcile_storage, sync_role_labels,
};
use crate::controller::recovery::{RecoveryPlan, parse_target_time, resolve_recovery_plan};
use crate::controller::registry::InstanceRegistry;
use crate::controller::resize::append_resize_event;
use crate::controller::state_machine::{TransitionContext, advance_phase};
use crate::controller::status::{ConditionBuilder, update_status};
use crate::controller::topology::{TopologyAction, TopologyInput, plan_topology};
use crate::controller::validation::validate_spec;
use crate::crd::{
    Backup, BackupPhase, ClusterPhase, PENDING_FAILOVER_MARKER, PostgresCluster, PromotionKind,
    RecoverySpec, RecoveryStatus,
};
use crate::objectstore::BarmanLocation;
use crate::postgres::{InstanceStatus, PGDATA_MOUNT, PGWAL_MOUNT};
use crate::resources::certificate::{generate_certificates, resolve_certificate_secrets};
use crate::resources::common::{ANNOTATION_FENCED_INSTANCES, cluster_label_selector};
use crate::resources::inheritance::InheritedMetadata;
use crate::resources::instance::{BootstrapMode, RecoveryBootstrap};
use crate::resources::{pdb, service};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "pgha.smoketurner.com/finalizer";

const INVALID_SPEC_REQUEUE: Duration = Duration::from_secs(300);
const FAST_REQUEUE: Duration = Duration::from_secs(5);
const STEADY_REQUEUE: Duration = Duration::from_secs(30);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let started = Instant::now();

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &ns).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_cluster(&cluster, &ctx, &ns).await;

    if let Some(metrics) = ctx.metrics() {
        metrics.record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.record_error(&ns, &name);
        }
    }

    match result {
        Ok(action) => {
            debug!("Reconciliation completed");
            Ok(action)
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            ctx.publish_warning_event(cluster.as_ref(), "ReconcileFailed", "Reconcile", Some(e.to_string()))
                .await;
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!("Retryable error for {}: {:?}, requeuing in {:?}", name, error, delay);
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Everything observed at the start of a pass
struct Observed {
    pods: Vec<Pod>,
    pvcs: Vec<PersistentVolumeClaim>,
    registry: InstanceRegistry,
    probes: BTreeMap<String, InstanceStatus>,
}

async fn observe(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<Observed> {
    let name = cluster.name_any();
    let lp = ListParams::default().labels(&cluster_label_selector(&name));

    let pods = Api::<Pod>::namespaced(ctx.client.clone(), ns).list(&lp).await?.items;
    let pvcs = Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), ns)
        .list(&lp)
        .await?
        .items;
    let nodes = match Api::<Node>::all(ctx.client.clone()).list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) => {
            warn!(error = %e, "cannot list nodes, drain detection disabled for this pass");
            Vec::new()
        }
    };

    let registry = InstanceRegistry::from_objects(&name, &pods, &pvcs, &nodes, &ctx.config.drain_taints);
    let probes = probe_instances(ctx, ns, &registry).await;

    Ok(Observed {
        pods,
        pvcs,
        registry,
        probes,
    })
}

/// Ask every live instance for its status concurrently
///
/// Instances that do not answer are left out of the map.
async fn probe_instances(
    ctx: &Context,
    ns: &str,
    registry: &InstanceRegistry,
) -> BTreeMap<String, InstanceStatus> {
    let targets: Vec<&str> = registry
        .iter()
        .filter(|i| !i.deleting && !i.evicted && i.node.is_some())
        .map(|i| i.name.as_str())
        .collect();
    let results = join_all(targets.iter().map(|name| ctx.instances.status(ns, name))).await;

    targets
        .into_iter()
        .zip(results)
        .filter_map(|(name, result)| match result {
            Ok(status) => Some((name.to_string(), status)),
            Err(e) => {
                debug!(instance = %name, error = %e, "instance did not answer status probe");
                None
            }
        })
        .collect()
}

/// Outcome of the bootstrap gate for the first instance
#[derive(Default)]
struct BootstrapGate {
    first_bootstrap: Option<BootstrapMode>,
    recovery: Option<RecoveryStatus>,
    /// Recovery bootstrap is configured but no verified plan exists
    blocked: bool,
    failure: Option<String>,
}

async fn bootstrap_gate(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    registry: &InstanceRegistry,
    has_primary: bool,
) -> Result<BootstrapGate> {
    let mut gate = BootstrapGate::default();

    if let Some(recovery) = cluster.spec.recovery() {
        let first_pass = registry.is_empty() && registry.orphan_serials().next().is_none() && !has_primary;
        if !first_pass {
            return Ok(gate);
        }
        gate.blocked = true;
        match resolve_recovery(cluster, ctx, ns, recovery).await {
            Ok((plan, bootstrap)) => {
                info!(backup = %plan.backup.id, expected_timeline = plan.expected_timeline, "recovery plan verified");
                gate.recovery = Some(plan.to_status());
                gate.first_bootstrap = Some(BootstrapMode::Recovery(bootstrap));
                gate.blocked = false;
            }
            Err(Error::ValidationError(message)) | Err(Error::NotFound(message)) => {
                warn!(reason = %message, "recovery plan cannot be resolved");
                gate.failure = Some(message);
            }
            Err(e) => return Err(e),
        }
        return Ok(gate);
    }

    if let Some(import) = cluster
        .spec
        .bootstrap
        .as_ref()
        .and_then(|b| b.initdb.as_ref())
        .and_then(|i| i.import.as_ref())
    {
        let source = cluster
            .spec
            .external_cluster(&import.source.external_cluster)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "import source {} is not an external cluster",
                    import.source.external_cluster
                ))
            })?;
        gate.first_bootstrap = Some(BootstrapMode::Import {
            import: import.clone(),
            source: source.clone(),
        });
    }
    Ok(gate)
}

/// Locate the recovery source and verify its WAL is archived
async fn resolve_recovery(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    spec: &RecoverySpec,
) -> Result<(RecoveryPlan, RecoveryBootstrap)> {
    let raw_target = spec.recovery_target.as_ref().and_then(|t| t.target_time.clone());
    let target_time = raw_target.as_deref().map(parse_target_time).transpose()?;
    let exclusive = spec
        .recovery_target
        .as_ref()
        .and_then(|t| t.exclusive)
        .unwrap_or(false);

    let (object_store, server_name, backup_id) = if let Some(reference) = &spec.backup {
        let backups: Api<Backup> = Api::namespaced(ctx.client.clone(), ns);
        let backup = backups
            .get_opt(&reference.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {}", reference.name)))?;
        let status = backup.status.clone().unwrap_or_default();
        if status.phase != BackupPhase::Completed {
            return Err(Error::ValidationError(format!(
                "backup {} is {}, not Completed",
                reference.name, status.phase
            )));
        }
        let backup_id = status
            .backup_id
            .clone()
            .ok_or_else(|| Error::ValidationError(format!("backup {} has no backup id", reference.name)))?;

        // The source cluster may be gone; its backups are still readable
        // with this cluster's store configuration
        let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), ns);
        let source = clusters.get_opt(&backup.spec.cluster.name).await?;
        let mut config = source
            .as_ref()
            .and_then(|c| c.spec.backup.as_ref())
            .or(cluster.spec.backup.as_ref())
            .map(|b| b.barman_object_store.clone())
            .ok_or_else(|| {
                Error::ValidationError(format!("no object store configuration for backup {}", reference.name))
            })?;
        if let Some(destination) = status.destination_path {
            config.destination_path = destination;
        }
        let server_name = status
            .server_name
            .unwrap_or_else(|| backup.spec.cluster.name.clone());
        config.server_name = Some(server_name.clone());
        (config, server_name, Some(backup_id))
    } else if let Some(source) = &spec.source {
        let external = cluster
            .spec
            .external_cluster(source)
            .ok_or_else(|| Error::ValidationError(format!("recovery source {} is not an external cluster", source)))?;
        let config = external
            .barman_object_store
            .clone()
            .ok_or_else(|| Error::ValidationError(format!("external cluster {} has no barmanObjectStore", source)))?;
        let server_name = config.server_name.clone().unwrap_or_else(|| external.name.clone());
        (config, server_name, None)
    } else {
        return Err(Error::ValidationError(
            "recovery needs either a backup or a source".to_string(),
        ));
    };

    let store = ctx.object_stores.open(ns, &object_store).await?;
    let location = BarmanLocation::new(&object_store, &server_name)?;
    let plan = resolve_recovery_plan(store.as_ref(), &location, backup_id.as_deref(), target_time).await?;

    let bootstrap = RecoveryBootstrap {
        backup_id: plan.backup.id.clone(),
        object_store,
        server_name,
        target_time: raw_target,
        exclusive,
    };
    Ok((plan, bootstrap))
}

/// Fence instances whose volume filled up
async fn reconcile_fencing(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    registry: &InstanceRegistry,
    previous_pressure: &[String],
) -> Result<(FencedInstances, Vec<String>)> {
    let current = FencedInstances::parse(
        cluster
            .annotations()
            .get(ANNOTATION_FENCED_INSTANCES)
            .map(String::as_str),
    )?;
    let mount = if cluster.spec.wal_storage.is_some() {
        PGWAL_MOUNT
    } else {
        PGDATA_MOUNT
    };

    let exhausted = find_exhausted_instances(ctx.instances.as_ref(), ns, registry, mount).await;
    let plan = plan_fencing(&current, previous_pressure, &exhausted);
    if plan.annotation_changed() {
        patch_fence_annotation(ctx, cluster, &plan.fenced).await?;
        for instance in &plan.newly_fenced {
            warn!(instance = %instance, "fencing instance, volume is full");
            ctx.publish_warning_event(
                cluster,
                "InstanceFenced",
                "Fence",
                Some(format!("{} fenced: not enough disk space", instance)),
            )
            .await;
        }
        for instance in &plan.reapplied {
            warn!(instance = %instance, "volume still full, fencing again");
            ctx.publish_warning_event(
                cluster,
                "FencingReapplied",
                "Fence",
                Some(format!("{} fenced again: volume is still full", instance)),
            )
            .await;
        }
    }

    Ok((plan.fenced, plan.disk_pressure_instances))
}

/// Services, disruption budgets and certificates
async fn apply_owned_resources(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
    inherited: &InheritedMetadata,
) -> Result<()> {
    for svc in service::generate_services(cluster, inherited) {
        apply_resource(ctx, ns, &svc).await?;
    }
    if let Some(primary_pdb) = pdb::generate_primary_pdb(cluster, inherited) {
        apply_resource(ctx, ns, &primary_pdb).await?;
    }
    apply_resource(ctx, ns, &pdb::generate_replica_pdb(cluster, inherited)).await?;
    for certificate in generate_certificates(cluster, inherited) {
        apply_certificate(ctx, ns, &certificate).await?;
    }
    Ok(())
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// One full reconcile pass
async fn reconcile_cluster(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    let store = ctx.status_store.as_ref();
    let retries = ctx.config.status_update_retries;
    let generation = cluster.metadata.generation;
    let now = Utc::now();

    if let Err(e) = validate_spec(cluster) {
        let message = e.to_string();
        warn!(error = %message, "invalid cluster spec");
        update_status(store, ns, &name, retries, |s| {
            s.conditions = ConditionBuilder::from_existing(s.conditions.clone(), generation)
                .config_valid(false, "InvalidSpec", &message)
                .build();
            Ok(())
        })
        .await?;
        ctx.publish_warning_event(cluster, "InvalidSpec", "Validate", Some(message))
            .await;
        return Ok(Action::requeue(INVALID_SPEC_REQUEUE));
    }

    let inherited = ctx.inheritance.evaluate(cluster);
    let observed = observe(cluster, ctx, ns).await?;
    let registry = &observed.registry;
    let status = store.get(ns, &name).await?.status;

    let gate = bootstrap_gate(cluster, ctx, ns, registry, status.current_primary.is_some()).await?;
    if let Some(message) = &gate.failure {
        ctx.publish_warning_event(cluster, "RecoveryFailed", "Bootstrap", Some(message.clone()))
            .await;
    }

    let (fenced, disk_pressure) =
        reconcile_fencing(cluster, ctx, ns, registry, &status.disk_pressure_instances).await?;

    // Topology first; later steps plan from the status it wrote
    let topology = plan_topology(&TopologyInput {
        registry,
        status: &status,
        fenced: &fenced,
        probes: &observed.probes,
        failover_delay: Duration::from_secs(cluster.spec.failover_delay.into()),
        wal_receiver_timeout: ctx.config.wal_receiver_timeout(),
        fence_recovery_timeout: ctx.config.fence_recovery_timeout(),
        now,
    });
    if topology != TopologyAction::Steady {
        debug!(action = ?topology, "topology step");
    }
    let topology_delay = apply_topology(ctx, cluster, &topology, now).await?;
    let no_eligible_standby = matches!(topology, TopologyAction::NoEligibleStandby { .. });
    let status = store.get(ns, &name).await?.status;
    let primary = status.current_primary.as_deref();

    let live_pods: Vec<Pod> = observed
        .pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .cloned()
        .collect();
    sync_role_labels(ctx, ns, &live_pods, primary, &fenced).await?;

    apply_owned_resources(cluster, ctx, ns, &inherited).await?;
    let certificates = resolve_certificate_secrets(cluster);

    let instance_action = plan_instances(&InstanceInput {
        cluster_name: &name,
        registry,
        status: &status,
        fenced: &fenced,
        probes: &observed.probes,
        desired_instances: cluster.spec.instances,
        image: &cluster.spec.image_name,
        primary_update_method: cluster.spec.primary_update_method,
        bootstrap_blocked: gate.blocked,
    });
    match &instance_action {
        InstanceAction::None => {}
        InstanceAction::Wait { reason } => debug!(reason = %reason, "instance changes waiting"),
        action => info!(action = ?action, "instance step"),
    }
    apply_instance_action(
        ctx,
        cluster,
        registry,
        &instance_action,
        InstanceSetup {
            primary,
            first_bootstrap: gate.first_bootstrap,
            fenced: &fenced,
            inherited: &inherited,
            certificates: &certificates,
            pvcs: &observed.pvcs,
        },
    )
    .await?;

    let storage = reconcile_storage(
        ctx,
        cluster,
        registry,
        &observed.pvcs,
        primary,
        &status.auto_resize_events,
        now,
    )
    .await?;

    let primary_ready = primary
        .and_then(|p| registry.get(p))
        .is_some_and(|i| i.is_healthy());

    let (slots, standby_slots, extensions) = match primary {
        Some(p) if primary_ready && !status.promotion_in_progress() => {
            let slots = match reconcile_slots(ctx, cluster, registry, p).await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(error = %e, "replication slot reconciliation failed");
                    status.ha_replication_slots.clone()
                }
            };
            let standby_slots = match reconcile_standby_slots(ctx, cluster, registry, p).await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(error = %e, "standby replication slot reconciliation failed");
                    status.standby_replication_slots.clone()
                }
            };
            let extensions = reconcile_extensions(
                ctx.instances.as_ref(),
                ns,
                p,
                cluster.spec.app_database(),
                &cluster.spec.postgresql.extensions,
            )
            .await;
            (slots, standby_slots, extensions)
        }
        _ => (
            status.ha_replication_slots.clone(),
            status.standby_replication_slots.clone(),
            status.extensions.clone(),
        ),
    };

    let failover_in_progress = status.target_primary.as_deref() == Some(PENDING_FAILOVER_MARKER)
        || status
            .promotion
            .as_ref()
            .is_some_and(|p| p.kind == PromotionKind::Failover);
    let tctx = TransitionContext {
        ready_instances: count(registry.ready_count()),
        desired_instances: cluster.spec.instances,
        existing_instances: count(registry.len()),
        primary_ready,
        failover_in_progress,
        switchover_in_progress: status.promotion_in_progress() && !failover_in_progress,
        no_eligible_standby,
        disk_pressure: !disk_pressure.is_empty(),
        resize_pending: storage.resize_pending(),
        image_outdated: registry
            .iter()
            .any(|i| i.image.as_deref() != Some(cluster.spec.image_name.as_str())),
        recovery_failed: gate.failure.is_some(),
    };

    let (next_phase, phase_reason) = advance_phase(status.phase, status.phase_reason.as_deref(), &tctx);
    let phase_reason = gate.failure.clone().unwrap_or(phase_reason);

    let recovery = gate.recovery.clone().or_else(|| status.recovery.clone());
    let recovery_verified = recovery.as_ref().is_some_and(|r| r.verified);
    let recovery_requested = cluster.spec.recovery().is_some();
    let ready = next_phase == ClusterPhase::Ready && (!recovery_requested || recovery_verified);
    let degraded = matches!(
        next_phase,
        ClusterPhase::Degraded | ClusterPhase::NotEnoughDiskSpace | ClusterPhase::RecoveryFailed
    );
    let ready_count = count(registry.ready_count());
    let phase_label = next_phase.to_string();

    update_status(store, ns, &name, retries, |s| {
        s.phase = next_phase;
        s.phase_reason = (!phase_reason.is_empty()).then(|| phase_reason.clone());
        s.instances = count(registry.len());
        s.ready_instances = ready_count;
        s.instance_names = registry.names();
        s.fenced_instances = fenced.to_status();
        s.disk_pressure_instances = disk_pressure.clone();
        s.certificates = certificates.clone();
        s.storage = storage.volumes.clone();
        for event in &storage.resize_events {
            append_resize_event(&mut s.auto_resize_events, event.clone(), now);
        }
        s.ha_replication_slots = slots.clone();
        s.standby_replication_slots = standby_slots.clone();
        s.extensions = extensions.clone();
        if recovery.is_some() {
            s.recovery = recovery.clone();
        }
        s.observed_generation = generation;

        let mut conditions = ConditionBuilder::from_existing(s.conditions.clone(), generation)
            .config_valid(true, "Valid", "Spec is valid")
            .ready(ready, &phase_label, &phase_reason)
            .progressing(next_phase.is_transitional(), &phase_label, &phase_reason)
            .degraded(degraded, &phase_label, &phase_reason);
        if recovery_requested {
            let (reason, message) = match (&gate.failure, recovery_verified) {
                (Some(message), _) => ("RecoveryPlanFailed", message.as_str()),
                (None, true) => ("RecoveryPlanVerified", "All required WAL is archived"),
                (None, false) => ("RecoveryPlanPending", "Recovery plan not resolved yet"),
            };
            conditions = conditions.recovery_verified(recovery_verified, reason, message);
        }
        s.conditions = conditions.build();
        Ok(())
    })
    .await?;

    if let Some(metrics) = ctx.metrics() {
        metrics.set_cluster_instances(ns, &name, cluster.spec.instances.into(), ready_count.into());
        metrics.set_fenced_instances(ns, &name, i64::from(count(fenced.to_status().len())));
    }

    let mut requeue = if next_phase.is_transitional() || instance_action != InstanceAction::None {
        FAST_REQUEUE
    } else {
        STEADY_REQUEUE
    };
    if let Some(delay) = topology_delay {
        requeue = requeue.min(delay.max(Duration::from_secs(1)));
    }
    Ok(Action::requeue(requeue))
}

/// Check if the resource has our finalizer
fn has_finalizer(cluster: &PostgresCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer to the resource
async fn add_finalizer(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), ns);
    let name = cluster.name_any();

    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Handle deletion of the PostgresCluster
///
/// Pods, PVCs and services carry owner references and are garbage
/// collected; only the finalizer has to go.
async fn handle_deletion(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    info!("Handling deletion of {}", name);

    if let Err(e) = update_status(
        ctx.status_store.as_ref(),
        ns,
        &name,
        ctx.config.status_update_retries,
        |s| {
            s.phase = ClusterPhase::Deleting;
            Ok(())
        },
    )
    .await
    {
        debug!(error = %e, "could not record Deleting phase");
    }

    if has_finalizer(cluster) {
        let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), ns);
        let finalizers: Vec<&String> = cluster.finalizers().iter().filter(|f| *f != FINALIZER).collect();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Removed finalizer from {}", name);
    }

    Ok(Action::await_change())
}
