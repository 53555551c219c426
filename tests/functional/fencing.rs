//! Disk-pressure fencing, the topology and the phase driven together

use chrono::Duration;

use pgha_operator::crd::ClusterPhase;

use crate::common::*;
use crate::{Simulation, kinds};

const NOW: &str = "2026-03-01T12:00:00Z";

/// Test: a primary that fills its WAL volume is fenced, not failed over,
/// and keeps the primary role once the volume is grown
#[tokio::test]
async fn test_full_wal_volume_is_fenced_until_primary_recovers() {
    let sim = Simulation::three_instances(0x100, 0x300);
    let start = ts(NOW);
    sim.instances.fill_volume("pg-1");

    assert!(sim.settle(start).await.is_empty());
    assert_eq!(sim.fence_annotation().as_deref(), Some(r#"["pg-1"]"#));
    let status = sim.status().await;
    assert_eq!(status.phase, ClusterPhase::NotEnoughDiskSpace);
    assert_eq!(status.disk_pressure_instances, vec!["pg-1"]);
    assert_eq!(status.fenced_instances, vec!["pg-1"]);
    assert!(status.primary_failing_since.is_none());

    // Removing the fence while the volume is still full puts it back
    sim.set_fence_annotation(None);
    assert_eq!(kinds(&[sim.step(start + Duration::seconds(30)).await]), vec!["Steady"]);
    assert_eq!(sim.fence_annotation().as_deref(), Some(r#"["pg-1"]"#));
    assert_eq!(sim.status().await.phase, ClusterPhase::NotEnoughDiskSpace);

    // Volume grown and fence removed; postgres is still starting
    sim.instances.grow_volume("pg-1");
    sim.set_fence_annotation(None);
    let lifted = start + Duration::seconds(60);
    assert_eq!(kinds(&[sim.step(lifted).await]), vec!["MarkFenceLifted"]);
    let status = sim.status().await;
    assert!(status.fence_lifted_at.is_some());
    assert!(status.fenced_instances.is_empty());
    assert!(status.disk_pressure_instances.is_empty());

    for secs in [5, 60, 120] {
        let action = sim.step(lifted + Duration::seconds(secs)).await;
        assert_eq!(kinds(&[action]), vec!["AwaitFencedPrimary"]);
    }
    assert_eq!(sim.status().await.target_primary.as_deref(), Some("pg-1"));

    sim.instances.restart("pg-1");
    let actions = sim.settle(lifted + Duration::seconds(150)).await;
    assert_eq!(kinds(&actions), vec!["ClearPrimaryFailing"]);

    let status = sim.status().await;
    assert_eq!(status.current_primary.as_deref(), Some("pg-1"));
    assert!(status.fence_lifted_at.is_none());
    assert!(status.primary_failing_since.is_none());
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert!(!sim.instances.calls().iter().any(|c| c.starts_with("promote")));
}

/// Test: a primary that never comes back after the fence is lifted is
/// failed over once the recovery window has passed
#[tokio::test]
async fn test_lifted_fence_fails_over_after_recovery_window() {
    let sim = Simulation::three_instances(0x100, 0x300);
    let start = ts(NOW);
    sim.instances.fill_volume("pg-1");
    sim.settle(start).await;

    sim.instances.grow_volume("pg-1");
    sim.set_fence_annotation(None);
    assert_eq!(kinds(&[sim.step(start).await]), vec!["MarkFenceLifted"]);
    assert_eq!(
        kinds(&[sim.step(start + Duration::seconds(299)).await]),
        vec!["AwaitFencedPrimary"]
    );

    let actions = sim.settle(start + Duration::seconds(301)).await;
    assert_eq!(
        kinds(&actions),
        vec!["MarkPrimaryFailing", "BeginFailover", "ElectPrimary", "Promote", "CompletePromotion"]
    );
    let status = sim.status().await;
    assert_eq!(status.current_primary.as_deref(), Some("pg-3"));
    assert!(status.fence_lifted_at.is_none());
    assert_eq!(sim.instances.calls(), vec!["promote pg-3"]);
}

/// Test: a standby that runs out of space is fenced and the primary keeps
/// serving
#[tokio::test]
async fn test_full_standby_volume_leaves_primary_alone() {
    let sim = Simulation::three_instances(0x100, 0x300);
    sim.instances.fill_volume("pg-3");

    assert!(sim.settle(ts(NOW)).await.is_empty());
    assert_eq!(sim.fence_annotation().as_deref(), Some(r#"["pg-3"]"#));
    let status = sim.status().await;
    assert_eq!(status.current_primary.as_deref(), Some("pg-1"));
    assert_eq!(status.phase, ClusterPhase::NotEnoughDiskSpace);
    assert!(status.fence_lifted_at.is_none());
}
