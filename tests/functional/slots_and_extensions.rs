//! HA replication slots and declared extensions against a simulated primary

use pgha_operator::controller::extensions::reconcile_extensions;
use pgha_operator::controller::operations::{begin_switchover, reconcile_slots, reconcile_standby_slots};
use pgha_operator::crd::ExtensionSpec;
use pgha_operator::postgres::{InstalledExtension, Lsn, ReplicationSlot};

use crate::common::*;
use crate::{NAMESPACE, Simulation};

fn slot(name: &str, active: bool) -> ReplicationSlot {
    ReplicationSlot {
        name: name.to_string(),
        active,
        restart_lsn: None,
    }
}

fn extension(name: &str, version: Option<&str>, database: Option<&str>) -> ExtensionSpec {
    ExtensionSpec {
        name: name.to_string(),
        version: version.map(String::from),
        database: database.map(String::from),
    }
}

fn slot_names(sim: &Simulation, instance: &str) -> Vec<String> {
    let mut names: Vec<String> = sim
        .instances
        .get(instance)
        .slots
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    names
}

// =============================================================================
// Replication slots
// =============================================================================

/// Test: one slot per standby; stale inactive slots dropped, active ones kept
#[tokio::test]
async fn test_slots_converge_on_primary() {
    let sim = Simulation::three_instances(0x100, 0x300);
    sim.instances.update("pg-1", |i| {
        i.slots = vec![
            slot("_pgha_pg_9", false),
            slot("_pgha_pg_8", true),
            slot("logical_sub", true),
        ];
    });
    let registry = sim.instances.registry();

    let kept = reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    assert_eq!(kept, vec!["_pgha_pg_2", "_pgha_pg_3", "_pgha_pg_8"]);
    assert_eq!(
        sim.instances.calls(),
        vec![
            "create_slot pg-1 _pgha_pg_2",
            "create_slot pg-1 _pgha_pg_3",
            "drop_slot pg-1 _pgha_pg_9",
        ]
    );
    assert_eq!(
        slot_names(&sim, "pg-1"),
        vec!["_pgha_pg_2", "_pgha_pg_3", "_pgha_pg_8", "logical_sub"]
    );

    // The stale slot is released and dropped on the next pass
    sim.instances.update("pg-1", |i| {
        for s in i.slots.iter_mut().filter(|s| s.name == "_pgha_pg_8") {
            s.active = false;
        }
    });
    let kept = reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    assert_eq!(kept, vec!["_pgha_pg_2", "_pgha_pg_3"]);
    assert_eq!(sim.instances.calls().len(), 4);
}

/// Test: converged slots cause no commands
#[tokio::test]
async fn test_slots_idempotent() {
    let sim = Simulation::three_instances(0x100, 0x300);
    let registry = sim.instances.registry();

    reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    let calls = sim.instances.calls().len();
    reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    assert_eq!(sim.instances.calls().len(), calls);
}

/// Test: after a failover the new primary gets a slot for the old one
#[tokio::test]
async fn test_slots_follow_new_primary() {
    let sim = Simulation::three_instances(0x100, 0x300);
    let registry = sim.instances.registry();

    let kept = reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-3").await.unwrap();
    assert_eq!(kept, vec!["_pgha_pg_1", "_pgha_pg_2"]);
}

/// Test: disabling HA slots drops every inactive prefixed slot
#[tokio::test]
async fn test_slots_disabled_drops_managed_slots() {
    let mut sim = Simulation::three_instances(0x100, 0x300);
    sim.cluster.spec.replication_slots.high_availability.enabled = false;
    sim.instances.update("pg-1", |i| {
        i.slots = vec![slot("_pgha_pg_2", false), slot("_pgha_pg_3", false)];
    });
    let registry = sim.instances.registry();

    let kept = reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    assert!(kept.is_empty());
    assert!(slot_names(&sim, "pg-1").is_empty());
}

/// Test: an unreachable primary fails the slot pass
#[tokio::test]
async fn test_slots_unreachable_primary() {
    let sim = Simulation::three_instances(0x100, 0x300);
    sim.instances.kill("pg-1");
    let registry = sim.instances.registry();

    assert!(reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.is_err());
}

/// Test: after a switchover the demoted primary sheds the slot of the new
/// primary and mirrors the remaining ones
#[tokio::test]
async fn test_demoted_primary_slots_follow_new_primary() {
    let sim = Simulation::three_instances(0x100, 0x300);
    let registry = sim.instances.registry();
    reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-1").await.unwrap();
    assert_eq!(slot_names(&sim, "pg-1"), vec!["_pgha_pg_2", "_pgha_pg_3"]);

    let now = ts("2026-03-01T12:00:00Z");
    begin_switchover(&sim.ctx, &sim.cluster, "pg-2", "requested by user", now)
        .await
        .unwrap();
    sim.settle(now).await;
    assert_eq!(sim.status().await.current_primary.as_deref(), Some("pg-2"));

    reconcile_slots(&sim.ctx, &sim.cluster, &registry, "pg-2").await.unwrap();
    let published = reconcile_standby_slots(&sim.ctx, &sim.cluster, &registry, "pg-2")
        .await
        .unwrap();

    assert_eq!(published["pg-1"], vec!["_pgha_pg_3"]);
    assert_eq!(published["pg-3"], vec!["_pgha_pg_1"]);
    assert_eq!(slot_names(&sim, "pg-1"), vec!["_pgha_pg_3"]);
    assert_eq!(slot_names(&sim, "pg-3"), vec!["_pgha_pg_1"]);
    assert!(sim.instances.calls().contains(&"drop_slot pg-1 _pgha_pg_2".to_string()));

    // The mirrored slot is moved up to the primary's position
    let mirrored = sim.instances.get("pg-1").slots;
    assert_eq!(mirrored[0].restart_lsn, Some(Lsn(0x100)));

    // A second pass has nothing left to do
    let calls = sim.instances.calls().len();
    reconcile_standby_slots(&sim.ctx, &sim.cluster, &registry, "pg-2")
        .await
        .unwrap();
    assert_eq!(sim.instances.calls().len(), calls);
}

// =============================================================================
// Extensions
// =============================================================================

/// Test: missing extensions are created, failures reported per extension
#[tokio::test]
async fn test_extensions_created_and_reported() {
    let sim = Simulation::three_instances(0x100, 0x300);
    sim.instances.update("pg-1", |i| {
        i.extensions.insert(
            "app".to_string(),
            vec![InstalledExtension {
                name: "pg_stat_statements".to_string(),
                version: "1.10".to_string(),
            }],
        );
    });
    sim.instances.break_database("analytics");

    let wanted = vec![
        extension("pg_stat_statements", None, None),
        extension("postgis", Some("3.4"), None),
        extension("vector", None, Some("analytics")),
    ];
    let statuses = reconcile_extensions(sim.instances.as_ref(), NAMESPACE, "pg-1", "app", &wanted).await;
    assert_eq!(statuses.len(), 3);

    let by_name = |name: &str| statuses.iter().find(|s| s.name == name).unwrap().clone();

    let existing = by_name("pg_stat_statements");
    assert!(existing.applied);
    assert_eq!(existing.version.as_deref(), Some("1.10"));

    let created = by_name("postgis");
    assert!(created.applied);
    assert_eq!(created.version.as_deref(), Some("3.4"));

    let failed = by_name("vector");
    assert!(!failed.applied);
    assert!(failed.message.unwrap().contains("does not exist"));

    assert_eq!(sim.instances.calls(), vec!["create_extension app postgis"]);

    // Second pass finds everything in place
    reconcile_extensions(sim.instances.as_ref(), NAMESPACE, "pg-1", "app", &wanted).await;
    assert_eq!(sim.instances.calls().len(), 1);
}
