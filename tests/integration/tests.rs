//! End-to-end tests against a real Kubernetes cluster
//!
//! Each test creates its own namespace and scoped operator.
//!
//! Run with: cargo test --test integration -- --ignored

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

use pgha_operator::controller::status::condition_types;
use pgha_operator::crd::{Backup, BackupPhase, ClusterPhase, PostgresCluster};
use pgha_operator::resources::common::{
    ANNOTATION_FENCED_INSTANCES, LABEL_FENCED, cluster_label_selector,
};

use crate::common::*;
use crate::{
    LONG_TIMEOUT, SHORT_TIMEOUT, ScopedOperator, SharedTestCluster, TestNamespace,
    backup_in_phase, ensure_crds_installed, has_condition, has_ready_instances, is_phase,
    primary_changed_from, wait_for,
};

/// Initialize tracing and make sure the CRDs exist
async fn init_test() -> Arc<SharedTestCluster> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn")
        .with_test_writer()
        .try_init();

    let cluster = SharedTestCluster::get().await.expect("Failed to get cluster");
    ensure_crds_installed(&cluster)
        .await
        .expect("Failed to install CRDs");
    cluster
}

/// Test: a single-instance cluster bootstraps and gets its services
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_single_instance_bootstrap() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "bootstrap").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &create_test_cluster("single", ns.name(), 1))
        .await
        .expect("create cluster");

    let ready = wait_for(&api, "single", is_phase(ClusterPhase::Ready), LONG_TIMEOUT)
        .await
        .expect("cluster ready");
    let status = ready.status.unwrap();
    assert_eq!(status.current_primary.as_deref(), Some("single-1"));
    assert_eq!(status.latest_generated_node, 1);

    let services: Api<Service> = Api::namespaced(client.clone(), ns.name());
    for suffix in ["rw", "ro", "r"] {
        services
            .get(&format!("single-{}", suffix))
            .await
            .expect("service exists");
    }

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), ns.name());
    let claims = pvcs
        .list(&ListParams::default().labels(&cluster_label_selector("single")))
        .await
        .expect("list pvcs");
    assert_eq!(claims.items.len(), 1);

    ns.cleanup().await.expect("cleanup");
}

/// Test: an invalid spec is reported in a condition instead of reconciled
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_invalid_spec_reported() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "invalid").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let pg = PostgresClusterBuilder::new("broken", ns.name())
        .with_storage("not-a-size", None)
        .build();
    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &pg).await.expect("create cluster");

    wait_for(
        &api,
        "broken",
        has_condition(condition_types::CONFIG_VALID, "False"),
        SHORT_TIMEOUT,
    )
    .await
    .expect("invalid spec condition");

    let pods: Api<Pod> = Api::namespaced(client.clone(), ns.name());
    let listed = pods
        .list(&ListParams::default().labels(&cluster_label_selector("broken")))
        .await
        .expect("list pods");
    assert!(listed.items.is_empty());

    ns.cleanup().await.expect("cleanup");
}

/// Test: deleting the primary pod promotes a standby
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_failover_on_primary_deletion() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "failover").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let pg = PostgresClusterBuilder::ha("ha", ns.name())
        .with_failover_delay(0)
        .build();
    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &pg).await.expect("create cluster");

    let ready = wait_for(&api, "ha", has_ready_instances(3), LONG_TIMEOUT)
        .await
        .expect("three ready instances");
    let primary = ready.status.unwrap().current_primary.expect("primary elected");

    let pods: Api<Pod> = Api::namespaced(client.clone(), ns.name());
    pods.delete(&primary, &DeleteParams::default()).await.expect("delete primary");

    let failed_over = wait_for(&api, "ha", primary_changed_from(&primary), LONG_TIMEOUT)
        .await
        .expect("new primary");
    let status = failed_over.status.unwrap();
    assert_ne!(status.current_primary.as_deref(), Some(primary.as_str()));
    assert!(status.timeline_id.unwrap_or(1) >= 2);

    ns.cleanup().await.expect("cleanup");
}

/// Test: fencing an instance through the annotation labels its pod
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_fence_annotation_labels_pod() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "fence").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &create_test_cluster("fenced", ns.name(), 2))
        .await
        .expect("create cluster");
    wait_for(&api, "fenced", has_ready_instances(2), LONG_TIMEOUT)
        .await
        .expect("cluster ready");

    let patch = json!({
        "metadata": { "annotations": { ANNOTATION_FENCED_INSTANCES: "[\"fenced-2\"]" } }
    });
    api.patch("fenced", &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("fence instance");

    let pods: Api<Pod> = Api::namespaced(client.clone(), ns.name());
    let labelled = kube::runtime::wait::await_condition(pods, "fenced-2", |pod: Option<&Pod>| {
        pod.and_then(|p| p.metadata.labels.as_ref())
            .and_then(|l| l.get(LABEL_FENCED))
            .is_some_and(|v| v == "true")
    });
    tokio::time::timeout(SHORT_TIMEOUT, labelled)
        .await
        .expect("fence label before timeout")
        .expect("watch pod");

    let fenced = api.get("fenced").await.expect("get cluster");
    assert_eq!(fenced.status.unwrap().fenced_instances, vec!["fenced-2"]);

    ns.cleanup().await.expect("cleanup");
}

/// Test: scaling up adds instances with new serials
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_scale_up() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "scale").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &create_test_cluster("grow", ns.name(), 1))
        .await
        .expect("create cluster");
    wait_for(&api, "grow", is_phase(ClusterPhase::Ready), LONG_TIMEOUT)
        .await
        .expect("cluster ready");

    let patch = json!({ "spec": { "instances": 3 } });
    api.patch("grow", &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("scale up");

    let scaled = wait_for(&api, "grow", has_ready_instances(3), LONG_TIMEOUT)
        .await
        .expect("three ready instances");
    let status = scaled.status.unwrap();
    assert_eq!(status.latest_generated_node, 3);
    assert_eq!(status.instance_names, vec!["grow-1", "grow-2", "grow-3"]);

    ns.cleanup().await.expect("cleanup");
}

/// Test: a backup for a cluster without backup configuration fails
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_backup_without_configuration_fails() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "backup").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let clusters: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    clusters
        .create(&PostParams::default(), &create_test_cluster("nobackup", ns.name(), 1))
        .await
        .expect("create cluster");

    let backup: Backup = serde_json::from_value(json!({
        "apiVersion": "pgha.smoketurner.com/v1alpha1",
        "kind": "Backup",
        "metadata": { "name": "manual", "namespace": ns.name() },
        "spec": { "cluster": { "name": "nobackup" } }
    }))
    .expect("valid backup");
    let backups: Api<Backup> = Api::namespaced(client.clone(), ns.name());
    backups.create(&PostParams::default(), &backup).await.expect("create backup");

    wait_for(&backups, "manual", backup_in_phase(BackupPhase::Failed), SHORT_TIMEOUT)
        .await
        .expect("backup failed");

    ns.cleanup().await.expect("cleanup");
}

/// Test: deleting the cluster releases the finalizer
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_cluster_deletion() {
    let cluster = init_test().await;
    let client = cluster.new_client().await.expect("create client");
    let ns = TestNamespace::create(client.clone(), "delete").await.expect("create ns");
    let _operator = ScopedOperator::start(client.clone(), ns.name()).await;

    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), ns.name());
    api.create(&PostParams::default(), &create_test_cluster("doomed", ns.name(), 1))
        .await
        .expect("create cluster");
    wait_for(&api, "doomed", is_phase(ClusterPhase::Ready), LONG_TIMEOUT)
        .await
        .expect("cluster ready");

    let uid = api.get("doomed").await.expect("get cluster").metadata.uid.unwrap();
    api.delete("doomed", &DeleteParams::default()).await.expect("delete cluster");
    let gone = kube::runtime::wait::await_condition(
        api.clone(),
        "doomed",
        kube::runtime::wait::conditions::is_deleted(&uid),
    );
    tokio::time::timeout(SHORT_TIMEOUT, gone)
        .await
        .expect("deleted before timeout")
        .expect("watch cluster");

    ns.cleanup().await.expect("cleanup");
}
