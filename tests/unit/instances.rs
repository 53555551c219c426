//! Instance lifecycle: self-heal, scaling and rolling updates

use std::collections::BTreeMap;

use pgha_operator::controller::fencing::FencedInstances;
use pgha_operator::controller::instances::{InstanceAction, InstanceInput, plan_instances};
use pgha_operator::controller::registry::InstanceRegistry;
use pgha_operator::crd::{PostgresClusterStatus, PrimaryUpdateMethod, PvcRole};
use pgha_operator::postgres::InstanceStatus;

use crate::common::*;

const NEW_IMAGE: &str = "ghcr.io/cloudnative-pg/postgresql:17";

struct Scenario {
    registry: InstanceRegistry,
    status: PostgresClusterStatus,
    fenced: FencedInstances,
    probes: BTreeMap<String, InstanceStatus>,
    desired: i32,
    image: &'static str,
    method: PrimaryUpdateMethod,
    bootstrap_blocked: bool,
}

impl Scenario {
    fn new(registry: InstanceRegistry, status: PostgresClusterStatus, desired: i32) -> Self {
        let probes = registry
            .iter()
            .map(|i| (i.name.clone(), standby_probe(0x100)))
            .collect();
        Self {
            registry,
            status,
            fenced: FencedInstances::default(),
            probes,
            desired,
            image: TEST_IMAGE,
            method: PrimaryUpdateMethod::Switchover,
            bootstrap_blocked: false,
        }
    }

    fn plan(&self) -> InstanceAction {
        plan_instances(&InstanceInput {
            cluster_name: "pg",
            registry: &self.registry,
            status: &self.status,
            fenced: &self.fenced,
            probes: &self.probes,
            desired_instances: self.desired,
            image: self.image,
            primary_update_method: self.method,
            bootstrap_blocked: self.bootstrap_blocked,
        })
    }
}

fn data_pvc(serial: i32) -> BTreeMap<PvcRole, String> {
    BTreeMap::from([(PvcRole::Data, format!("pg-{}", serial))])
}

mod self_heal_tests {
    use super::*;

    #[test]
    fn test_empty_cluster_recreates_primary_volumes_first() {
        let registry = InstanceRegistry::default()
            .with_orphan_pvcs(1, data_pvc(1))
            .with_orphan_pvcs(2, data_pvc(2));
        let scenario = Scenario::new(registry, status_with_primary("pg-2"), 2);
        assert_eq!(scenario.plan(), InstanceAction::Recreate { serial: 2 });
    }

    #[test]
    fn test_empty_cluster_recovers_during_pending_failover() {
        let registry = InstanceRegistry::default().with_orphan_pvcs(1, data_pvc(1));
        let mut status = status_with_primary("pg-1");
        status.target_primary = Some(pgha_operator::crd::PENDING_FAILOVER_MARKER.to_string());
        let scenario = Scenario::new(registry, status, 1);
        assert_eq!(scenario.plan(), InstanceAction::Recreate { serial: 1 });
    }

    #[test]
    fn test_evicted_standby_is_deleted() {
        let registry = registry_of(&[instance(1, true), evicted(2), instance(3, true)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 3);
        assert_eq!(
            scenario.plan(),
            InstanceAction::DeleteEvicted {
                instance: "pg-2".to_string()
            }
        );
    }

    #[test]
    fn test_evicted_primary_waits_for_failover() {
        let registry = registry_of(&[evicted(1), instance(2, true)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 2);
        assert!(!matches!(scenario.plan(), InstanceAction::DeleteEvicted { .. }));
    }

    #[test]
    fn test_evicted_single_instance_is_deleted() {
        let registry = registry_of(&[evicted(1)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 1);
        assert_eq!(
            scenario.plan(),
            InstanceAction::DeleteEvicted {
                instance: "pg-1".to_string()
            }
        );
    }

    #[test]
    fn test_standby_pvcs_without_pod_are_reused() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]).with_orphan_pvcs(3, data_pvc(3));
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 3);
        assert_eq!(scenario.plan(), InstanceAction::Recreate { serial: 3 });
    }

    #[test]
    fn test_nothing_happens_during_promotion() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]);
        let mut status = status_with_primary("pg-1");
        status.target_primary = Some("pg-2".to_string());
        let scenario = Scenario::new(registry, status, 3);
        assert!(matches!(scenario.plan(), InstanceAction::Wait { .. }));
    }
}

mod scaling_tests {
    use super::*;

    #[test]
    fn test_first_instance_uses_next_generated_serial() {
        let status = PostgresClusterStatus {
            latest_generated_node: 4,
            ..Default::default()
        };
        let scenario = Scenario::new(InstanceRegistry::default(), status, 3);
        assert_eq!(
            scenario.plan(),
            InstanceAction::Create {
                serial: 5,
                first: true
            }
        );
    }

    #[test]
    fn test_recovery_bootstrap_blocks_first_instance() {
        let mut scenario = Scenario::new(InstanceRegistry::default(), PostgresClusterStatus::default(), 1);
        scenario.bootstrap_blocked = true;
        assert!(matches!(scenario.plan(), InstanceAction::Wait { .. }));
    }

    #[test]
    fn test_scale_up_never_reuses_serials() {
        let registry = registry_of(&[instance(1, true), instance(3, true)]);
        let status = PostgresClusterStatus {
            latest_generated_node: 3,
            ..status_with_primary("pg-1")
        };
        let scenario = Scenario::new(registry, status, 3);
        assert_eq!(
            scenario.plan(),
            InstanceAction::Create {
                serial: 4,
                first: false
            }
        );
    }

    #[test]
    fn test_scale_down_never_removes_primary() {
        let registry = registry_of(&[instance(1, true), instance(2, true), instance(3, true)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-3"), 1);
        assert_eq!(
            scenario.plan(),
            InstanceAction::Remove {
                instance: "pg-2".to_string()
            }
        );
    }

    #[test]
    fn test_scale_down_prefers_unhealthy_standby() {
        let registry = registry_of(&[instance(1, true), instance(2, false), instance(3, true)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 2);
        assert_eq!(
            scenario.plan(),
            InstanceAction::Remove {
                instance: "pg-2".to_string()
            }
        );
    }

    #[test]
    fn test_at_desired_count_is_steady() {
        let registry = registry_of(&[instance(1, true), instance(2, true)]);
        let scenario = Scenario::new(registry, status_with_primary("pg-1"), 2);
        assert_eq!(scenario.plan(), InstanceAction::None);
    }
}

mod rolling_update_tests {
    use super::*;

    fn three_instances() -> Scenario {
        let registry = registry_of(&[instance(1, true), instance(2, true), instance(3, true)]);
        let mut scenario = Scenario::new(registry, status_with_primary("pg-1"), 3);
        scenario.image = NEW_IMAGE;
        scenario
    }

    #[test]
    fn test_standbys_restart_first_highest_serial() {
        assert_eq!(
            three_instances().plan(),
            InstanceAction::Restart {
                instance: "pg-3".to_string()
            }
        );
    }

    #[test]
    fn test_primary_switches_over_once_standbys_are_updated() {
        let updated = |serial| {
            let mut i = instance(serial, true);
            i.image = Some(NEW_IMAGE.to_string());
            i
        };
        let registry = registry_of(&[instance(1, true), updated(2), updated(3)]);
        let mut scenario = Scenario::new(registry, status_with_primary("pg-1"), 3);
        scenario.image = NEW_IMAGE;
        scenario.probes = probes(&[
            ("pg-1", primary_probe()),
            ("pg-2", standby_probe(0x100)),
            ("pg-3", standby_probe(0x200)),
        ]);
        assert_eq!(
            scenario.plan(),
            InstanceAction::SwitchoverForUpdate {
                target: "pg-3".to_string()
            }
        );

        scenario.method = PrimaryUpdateMethod::Restart;
        assert_eq!(
            scenario.plan(),
            InstanceAction::Restart {
                instance: "pg-1".to_string()
            }
        );
    }

    #[test]
    fn test_update_waits_for_readiness() {
        let mut scenario = three_instances();
        scenario.registry = registry_of(&[instance(1, true), instance(2, false), instance(3, true)]);
        assert!(matches!(scenario.plan(), InstanceAction::Wait { .. }));
    }

    #[test]
    fn test_single_instance_restarts_in_place() {
        let registry = registry_of(&[instance(1, true)]);
        let mut scenario = Scenario::new(registry, status_with_primary("pg-1"), 1);
        scenario.image = NEW_IMAGE;
        assert_eq!(
            scenario.plan(),
            InstanceAction::Restart {
                instance: "pg-1".to_string()
            }
        );
    }
}
