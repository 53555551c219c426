//! Planned promotions: manual switchover and node drains

use pgha_operator::controller::Error;
use pgha_operator::controller::operations::begin_switchover;
use pgha_operator::crd::PromotionKind;

use crate::common::*;
use crate::{Simulation, kinds};

const NOW: &str = "2026-03-01T12:00:00Z";

/// Test: switchover demotes the old primary before promoting the target
#[tokio::test]
async fn test_switchover_demotes_then_promotes() {
    let sim = Simulation::three_instances(0x100, 0x300);
    begin_switchover(&sim.ctx, &sim.cluster, "pg-2", "requested by user", ts(NOW))
        .await
        .unwrap();

    let status = sim.status().await;
    assert_eq!(status.target_primary.as_deref(), Some("pg-2"));
    let promotion = status.promotion.unwrap();
    assert_eq!(promotion.kind, PromotionKind::Switchover);
    assert_eq!(promotion.from.as_deref(), Some("pg-1"));

    let actions = sim.settle(ts(NOW)).await;
    assert_eq!(kinds(&actions), vec!["Demote", "Promote", "CompletePromotion"]);
    assert_eq!(sim.instances.calls(), vec!["demote pg-1", "promote pg-2"]);

    let status = sim.status().await;
    assert_eq!(status.current_primary.as_deref(), Some("pg-2"));
    assert_eq!(status.timeline_id, Some(2));
    assert!(!sim.instances.get("pg-1").is_primary);
}

/// Test: only one promotion may be in flight
#[tokio::test]
async fn test_second_switchover_rejected() {
    let sim = Simulation::three_instances(0x100, 0x300);
    begin_switchover(&sim.ctx, &sim.cluster, "pg-2", "first", ts(NOW))
        .await
        .unwrap();

    let err = begin_switchover(&sim.ctx, &sim.cluster, "pg-3", "second", ts(NOW))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransientError(_)));
    assert_eq!(sim.status().await.target_primary.as_deref(), Some("pg-2"));
}

/// Test: a target that stops being ready aborts the switchover
#[tokio::test]
async fn test_switchover_aborted_when_target_lost() {
    let sim = Simulation::three_instances(0x100, 0x300);
    begin_switchover(&sim.ctx, &sim.cluster, "pg-2", "requested by user", ts(NOW))
        .await
        .unwrap();
    sim.instances.kill("pg-2");

    let actions = sim.settle(ts(NOW)).await;
    assert_eq!(kinds(&actions), vec!["AbortSwitchover"]);

    let status = sim.status().await;
    assert_eq!(status.current_primary.as_deref(), Some("pg-1"));
    assert_eq!(status.target_primary.as_deref(), Some("pg-1"));
    assert!(status.promotion.is_none());
    assert!(sim.instances.calls().is_empty());
}

/// Test: the old primary crashing after demotion does not stall promotion
#[tokio::test]
async fn test_switchover_survives_old_primary_crash() {
    let sim = Simulation::three_instances(0x100, 0x300);
    begin_switchover(&sim.ctx, &sim.cluster, "pg-3", "requested by user", ts(NOW))
        .await
        .unwrap();

    assert_eq!(kinds(&[sim.step(ts(NOW)).await]), vec!["Demote"]);
    sim.instances.kill("pg-1");

    let actions = sim.settle(ts(NOW)).await;
    assert_eq!(kinds(&actions), vec!["Promote", "CompletePromotion"]);
    assert_eq!(sim.status().await.current_primary.as_deref(), Some("pg-3"));
}

/// Test: draining the primary's node moves the primary elsewhere
#[tokio::test]
async fn test_node_drain_moves_primary() {
    let sim = Simulation::three_instances(0x100, 0x300);
    sim.instances.update("pg-1", |i| i.node_draining = true);

    let actions = sim.settle(ts(NOW)).await;
    assert_eq!(
        kinds(&actions),
        vec!["BeginSwitchover", "Demote", "Promote", "CompletePromotion"]
    );
    assert_eq!(sim.status().await.current_primary.as_deref(), Some("pg-3"));
}

/// Test: a drain with every standby also draining leaves the primary in place
#[tokio::test]
async fn test_node_drain_without_target() {
    let sim = Simulation::three_instances(0x100, 0x300);
    for name in ["pg-1", "pg-2", "pg-3"] {
        sim.instances.update(name, |i| i.node_draining = true);
    }

    assert!(sim.settle(ts(NOW)).await.is_empty());
    assert_eq!(sim.status().await.current_primary.as_deref(), Some("pg-1"));
}
