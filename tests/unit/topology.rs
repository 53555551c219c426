//! Topology scenarios spanning several reconcile passes

use std::time::Duration;

use pgha_operator::controller::fencing::FencedInstances;
use pgha_operator::controller::topology::{TopologyAction, TopologyInput, plan_topology};
use pgha_operator::crd::{PENDING_FAILOVER_MARKER, PostgresClusterStatus, PromotionKind, PromotionStatus};
use pgha_operator::postgres::Lsn;

use crate::common::*;

fn plan(
    registry: &pgha_operator::controller::registry::InstanceRegistry,
    status: &PostgresClusterStatus,
    fenced: &FencedInstances,
    probes: &std::collections::BTreeMap<String, pgha_operator::postgres::InstanceStatus>,
    now: &str,
) -> TopologyAction {
    plan_topology(&TopologyInput {
        registry,
        status,
        fenced,
        probes,
        failover_delay: Duration::from_secs(10),
        wal_receiver_timeout: Duration::from_secs(30),
        fence_recovery_timeout: Duration::from_secs(300),
        now: ts(now),
    })
}

fn failover_status(from: &str, requested_at: &str) -> PostgresClusterStatus {
    PostgresClusterStatus {
        current_primary: Some(from.to_string()),
        target_primary: Some(PENDING_FAILOVER_MARKER.to_string()),
        promotion: Some(PromotionStatus {
            kind: PromotionKind::Failover,
            from: Some(from.to_string()),
            requested_at: requested_at.to_string(),
            reason: "primary pod is not ready".to_string(),
        }),
        ..Default::default()
    }
}

mod failover_tests {
    use super::*;

    #[test]
    fn test_failover_waits_for_delay() {
        let registry = registry_of(&[instance(1, false), instance(2, true), instance(3, true)]);
        let probes = probes(&[("pg-2", standby_probe(100)), ("pg-3", standby_probe(100))]);
        let fenced = FencedInstances::default();

        let mut status = status_with_primary("pg-1");
        let first = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:00Z");
        assert_eq!(first, TopologyAction::MarkPrimaryFailing);

        status.primary_failing_since = Some("2026-01-01T00:00:00Z".to_string());
        let within = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:04Z");
        assert_eq!(
            within,
            TopologyAction::AwaitFailoverDelay {
                remaining: Duration::from_secs(6)
            }
        );

        let after = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:10Z");
        assert!(matches!(after, TopologyAction::BeginFailover { ref from, .. } if from == "pg-1"));
    }

    #[test]
    fn test_primary_recovering_clears_failing_marker() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]);
        let probes = probes(&[("pg-1", primary_probe()), ("pg-2", standby_probe(100))]);
        let status = PostgresClusterStatus {
            primary_failing_since: Some("2026-01-01T00:00:00Z".to_string()),
            ..status_with_primary("pg-1")
        };
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:03Z");
        assert_eq!(action, TopologyAction::ClearPrimaryFailing);
    }

    #[test]
    fn test_evicted_primary_reason() {
        let registry = registry_of(&[evicted(1), instance(2, true)]);
        let probes = probes(&[("pg-2", standby_probe(100))]);
        let status = PostgresClusterStatus {
            primary_failing_since: Some("2026-01-01T00:00:00Z".to_string()),
            ..status_with_primary("pg-1")
        };
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:01:00Z");
        assert_eq!(
            action,
            TopologyAction::BeginFailover {
                from: "pg-1".to_string(),
                reason: "primary pod was evicted".to_string(),
            }
        );
    }

    #[test]
    fn test_fenced_primary_never_fails_over() {
        let registry = registry_of(&[instance(1, false), instance(2, true)]);
        let probes = probes(&[("pg-2", standby_probe(100))]);
        let fenced = FencedInstances::from_names(["pg-1"]);
        let status = status_with_primary("pg-1");
        let action = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:10:00Z");
        assert_eq!(action, TopologyAction::Steady);
    }
}

mod election_tests {
    use super::*;

    #[test]
    fn test_highest_replay_lsn_wins() {
        let registry = registry_of(&[instance(1, false), instance(2, true), instance(3, true)]);
        let probes = probes(&[("pg-2", standby_probe(0x100)), ("pg-3", standby_probe(0x200))]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:01Z");
        assert_eq!(
            action,
            TopologyAction::ElectPrimary {
                instance: "pg-3".to_string(),
                replay_lsn: Some(Lsn(0x200)),
            }
        );
    }

    #[test]
    fn test_tie_goes_to_lowest_serial() {
        let registry = registry_of(&[instance(1, false), instance(2, true), instance(3, true)]);
        let probes = probes(&[("pg-3", standby_probe(0x200)), ("pg-2", standby_probe(0x200))]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:01Z");
        assert!(matches!(action, TopologyAction::ElectPrimary { ref instance, .. } if instance == "pg-2"));
    }

    #[test]
    fn test_fenced_and_unreachable_standbys_are_skipped() {
        let registry = registry_of(&[instance(1, false), instance(2, true), instance(3, true), instance(4, true)]);
        // pg-4 is the most advanced but fenced; pg-3 never answered a probe
        let probes = probes(&[("pg-2", standby_probe(0x100)), ("pg-4", standby_probe(0x900))]);
        let fenced = FencedInstances::from_names(["pg-4"]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let action = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:01Z");
        assert!(matches!(action, TopologyAction::ElectPrimary { ref instance, .. } if instance == "pg-2"));
    }

    #[test]
    fn test_streaming_candidates_delay_election_until_timeout() {
        let registry = registry_of(&[instance(1, false), instance(2, true)]);
        let mut streaming = standby_probe(0x100);
        streaming.wal_receiver_active = true;
        let probes = probes(&[("pg-2", streaming)]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let fenced = FencedInstances::default();

        let early = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:05Z");
        assert_eq!(
            early,
            TopologyAction::WaitForWalReceivers {
                instances: vec!["pg-2".to_string()]
            }
        );

        let late = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:31Z");
        assert!(matches!(late, TopologyAction::ElectPrimary { .. }));
    }

    #[test]
    fn test_no_eligible_standby() {
        let registry = registry_of(&[instance(1, false), instance(2, false)]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let action = plan(
            &registry,
            &status,
            &FencedInstances::default(),
            &probes(&[]),
            "2026-01-01T00:00:01Z",
        );
        assert!(matches!(action, TopologyAction::NoEligibleStandby { .. }));
    }

    #[test]
    fn test_returning_primary_cancels_failover_without_candidates() {
        let registry = registry_of(&[instance(1, true), instance(2, false)]);
        let probes = probes(&[("pg-1", primary_probe())]);
        let status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:01Z");
        assert_eq!(action, TopologyAction::CancelFailover);
    }
}

mod promotion_tests {
    use super::*;

    fn switchover_status(from: &str, to: &str) -> PostgresClusterStatus {
        PostgresClusterStatus {
            current_primary: Some(from.to_string()),
            target_primary: Some(to.to_string()),
            promotion: Some(PromotionStatus {
                kind: PromotionKind::Switchover,
                from: Some(from.to_string()),
                requested_at: "2026-01-01T00:00:00Z".to_string(),
                reason: "requested".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_switchover_demotes_then_promotes_then_completes() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]);
        let status = switchover_status("pg-1", "pg-2");
        let fenced = FencedInstances::default();

        // Old primary still accepts writes
        let before = probes(&[("pg-1", primary_probe()), ("pg-2", standby_probe(0x100))]);
        assert_eq!(
            plan(&registry, &status, &fenced, &before, "2026-01-01T00:00:01Z"),
            TopologyAction::Demote {
                instance: "pg-1".to_string()
            }
        );

        // Old primary stopped
        let demoted = probes(&[("pg-2", standby_probe(0x100))]);
        assert_eq!(
            plan(&registry, &status, &fenced, &demoted, "2026-01-01T00:00:02Z"),
            TopologyAction::Promote {
                instance: "pg-2".to_string()
            }
        );

        // Target left recovery on a new timeline
        let mut promoted = primary_probe();
        promoted.timeline = Some(2);
        let after = probes(&[("pg-2", promoted)]);
        assert_eq!(
            plan(&registry, &status, &fenced, &after, "2026-01-01T00:00:03Z"),
            TopologyAction::CompletePromotion {
                instance: "pg-2".to_string(),
                timeline: Some(2),
            }
        );
    }

    #[test]
    fn test_switchover_to_fenced_target_aborts() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]);
        let status = switchover_status("pg-1", "pg-2");
        let fenced = FencedInstances::from_names(["pg-2"]);
        let probes = probes(&[("pg-1", primary_probe()), ("pg-2", standby_probe(0x100))]);
        let action = plan(&registry, &status, &fenced, &probes, "2026-01-01T00:00:01Z");
        assert!(matches!(action, TopologyAction::AbortSwitchover { .. }));
    }

    #[test]
    fn test_failover_target_lost_restarts_election() {
        let registry = registry_of(&[instance(1, false), instance(2, false), instance(3, true)]);
        let mut status = failover_status("pg-1", "2026-01-01T00:00:00Z");
        status.target_primary = Some("pg-2".to_string());
        let probes = probes(&[("pg-3", standby_probe(0x100))]);
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:05Z");
        assert!(matches!(action, TopologyAction::RestartElection { .. }));
    }

    #[test]
    fn test_draining_primary_switches_to_schedulable_standby() {
        let mut primary = instance(1, true);
        primary.node_draining = true;
        let mut draining_standby = instance(3, true);
        draining_standby.node_draining = true;
        let registry = registry_of(&[primary, instance(2, true), draining_standby]);
        let probes = probes(&[
            ("pg-1", primary_probe()),
            ("pg-2", standby_probe(0x100)),
            ("pg-3", standby_probe(0x900)),
        ]);
        let status = status_with_primary("pg-1");
        let action = plan(&registry, &status, &FencedInstances::default(), &probes, "2026-01-01T00:00:00Z");
        assert!(matches!(action, TopologyAction::BeginSwitchover { ref target, .. } if target == "pg-2"));
    }

    #[test]
    fn test_first_primary_is_adopted() {
        let registry = registry_of(&[instance(1, true)]);
        let probes = probes(&[("pg-1", primary_probe())]);
        let action = plan(
            &registry,
            &PostgresClusterStatus::default(),
            &FencedInstances::default(),
            &probes,
            "2026-01-01T00:00:00Z",
        );
        assert_eq!(
            action,
            TopologyAction::AdoptPrimary {
                instance: "pg-1".to_string()
            }
        );
    }
}
