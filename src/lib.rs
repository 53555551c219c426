pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod objectstore;
pub mod plugin;
pub mod postgres;
pub mod resources;
pub mod webhooks;

pub use config::{LogFormat, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, backup_error_policy, error_policy, reconcile,
    reconcile_backup, reconcile_scheduled_backup, scheduled_backup_error_policy,
};
pub use crd::{Backup, PostgresCluster, ScheduledBackup};
pub use health::{HealthState, Metrics};
pub use webhooks::{WEBHOOK_PORT, WebhookError, run_webhook_server};

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

type ReconcileResult<K> = std::result::Result<
    (ObjectRef<K>, Action),
    kube::runtime::controller::Error<Error, kube::runtime::watcher::Error>,
>;

/// Log the outcome of one reconciliation
///
/// NotFound errors are expected after deletion when related watch events
/// trigger a reconcile for an object that is already gone.
fn log_result<K>(kind: &str, result: ReconcileResult<K>)
where
    K: Resource,
{
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            let is_not_found = matches!(
                &e,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run the PostgresCluster controller
///
/// Watches clusters and the pods, PVCs, services and disruption budgets
/// they own. Scoped to `config.watch_namespace` when set.
pub async fn run_controller(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for PostgresCluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    if let Some(state) = &ctx.health_state {
        state.set_ready(true).await;
    }

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(pods, watcher_config.clone())
        .owns(pvcs, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(pdbs, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_result("PostgresCluster", result) })
        .await;

    tracing::error!("Cluster controller stream ended unexpectedly");
}

/// Run the Backup controller
pub async fn run_backup_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let backups: Api<Backup> = scoped_api(ctx.client.clone(), namespace.as_deref());
    tracing::info!(
        "Starting controller for Backup resources (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    Controller::new(backups, WatcherConfig::default().any_semantic())
        .run(reconcile_backup, backup_error_policy, ctx)
        .for_each(|result| async move { log_result("Backup", result) })
        .await;

    tracing::error!("Backup controller stream ended unexpectedly");
}

/// Run the ScheduledBackup controller
///
/// Backups created by a schedule are owned by it when
/// `backupOwnerReference: self`, so their changes requeue the schedule.
pub async fn run_scheduled_backup_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let scheduled: Api<ScheduledBackup> = scoped_api(ctx.client.clone(), namespace.as_deref());
    let backups: Api<Backup> = scoped_api(ctx.client.clone(), namespace.as_deref());
    tracing::info!(
        "Starting controller for ScheduledBackup resources (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    let watcher_config = WatcherConfig::default().any_semantic();
    Controller::new(scheduled, watcher_config.clone())
        .owns(backups, watcher_config)
        .run(reconcile_scheduled_backup, scheduled_backup_error_policy, ctx)
        .for_each(|result| async move { log_result("ScheduledBackup", result) })
        .await;

    tracing::error!("ScheduledBackup controller stream ended unexpectedly");
}
