//! Instance lifecycle planning: self-healing, scaling and rolling updates
//!
//! Like topology, [`plan_instances`] returns one step per pass. Apart from
//! bringing back a cluster whose pods are all gone, nothing happens while a
//! promotion is in flight.

use crate::controller::fencing::FencedInstances;
use crate::controller::registry::{Instance, InstanceRegistry};
use crate::controller::topology::most_advanced;
use crate::crd::{PostgresClusterStatus, PrimaryUpdateMethod};
use crate::postgres::InstanceStatus;
use crate::resources::instance::parse_serial;

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceAction {
    None,
    /// Create the pod (and PVCs) of a new serial
    Create { serial: i32, first: bool },
    /// Recreate the pod of a serial whose PVCs survived
    Recreate { serial: i32 },
    /// Delete an evicted pod so it can be recreated
    DeleteEvicted { instance: String },
    /// Scale down: delete the pod and its PVCs
    Remove { instance: String },
    /// Delete the pod so it comes back on the new image
    Restart { instance: String },
    /// Move the primary to an updated standby before restarting it
    SwitchoverForUpdate { target: String },
    /// Waiting for readiness before the next step
    Wait { reason: String },
}

pub struct InstanceInput<'a> {
    pub cluster_name: &'a str,
    pub registry: &'a InstanceRegistry,
    pub status: &'a PostgresClusterStatus,
    pub fenced: &'a FencedInstances,
    pub probes: &'a BTreeMap<String, InstanceStatus>,
    pub desired_instances: i32,
    pub image: &'a str,
    pub primary_update_method: PrimaryUpdateMethod,
    /// Recovery bootstrap is configured and its plan is not yet verified
    pub bootstrap_blocked: bool,
}

pub fn plan_instances(input: &InstanceInput<'_>) -> InstanceAction {
    let status = input.status;
    let registry = input.registry;
    let primary = status.current_primary.as_deref();

    let primary_serial = primary.and_then(|p| parse_serial(input.cluster_name, p));

    // With no pod left, bring back the primary's volumes first, even while a
    // failover is waiting for a candidate
    if registry.is_empty() {
        let serial = primary_serial
            .filter(|s| registry.orphan_pvcs(*s).is_some())
            .or_else(|| registry.orphan_serials().next());
        if let Some(serial) = serial {
            return InstanceAction::Recreate { serial };
        }
    }

    if status.promotion_in_progress() {
        return InstanceAction::Wait {
            reason: "promotion in progress".to_string(),
        };
    }

    // Evicted standbys go right away; an evicted primary waits for failover
    if let Some(evicted) = registry
        .iter()
        .find(|i| i.evicted && !i.deleting && (Some(i.name.as_str()) != primary || registry.len() == 1))
    {
        return InstanceAction::DeleteEvicted {
            instance: evicted.name.clone(),
        };
    }

    // The primary's own PVCs are only reused once nothing else can take over
    let orphan = registry
        .orphan_serials()
        .find(|serial| primary_serial != Some(*serial));
    if let Some(serial) = orphan {
        return InstanceAction::Recreate { serial };
    }

    if registry.is_empty() {
        if input.bootstrap_blocked {
            return InstanceAction::Wait {
                reason: "waiting for a verified recovery plan".to_string(),
            };
        }
        return InstanceAction::Create {
            serial: status.latest_generated_node.max(registry.highest_serial().unwrap_or(0)) + 1,
            first: true,
        };
    }

    let Some(primary) = primary else {
        return InstanceAction::Wait {
            reason: "waiting for the first instance to become primary".to_string(),
        };
    };

    let count = i32::try_from(registry.len()).unwrap_or(i32::MAX);
    let all_ready = registry.iter().all(Instance::is_healthy);

    if count > input.desired_instances {
        let victim = registry
            .standbys(Some(primary))
            .max_by_key(|i| (!i.is_healthy(), i.serial));
        if let Some(victim) = victim {
            return InstanceAction::Remove {
                instance: victim.name.clone(),
            };
        }
    }

    if count < input.desired_instances {
        if !all_ready {
            return InstanceAction::Wait {
                reason: "waiting for instances to be ready before scaling up".to_string(),
            };
        }
        let next = status.latest_generated_node.max(registry.highest_serial().unwrap_or(0)) + 1;
        return InstanceAction::Create {
            serial: next,
            first: false,
        };
    }

    let outdated = |i: &&Instance| i.image.as_deref().is_some_and(|img| img != input.image);
    if registry.iter().any(|i| outdated(&i)) {
        if !all_ready {
            return InstanceAction::Wait {
                reason: "waiting for instances to be ready before the next restart".to_string(),
            };
        }
        if let Some(standby) = registry
            .standbys(Some(primary))
            .filter(outdated)
            .max_by_key(|i| i.serial)
        {
            return InstanceAction::Restart {
                instance: standby.name.clone(),
            };
        }

        if count > 1 && input.primary_update_method == PrimaryUpdateMethod::Switchover {
            let target = most_advanced(
                registry
                    .standbys(Some(primary))
                    .filter(|i| i.is_healthy() && !input.fenced.is_fenced(&i.name))
                    .filter(|i| input.probes.contains_key(&i.name)),
                input.probes,
            );
            if let Some((target, _)) = target {
                return InstanceAction::SwitchoverForUpdate {
                    target: target.name.clone(),
                };
            }
        }
        return InstanceAction::Restart {
            instance: primary.to_string(),
        };
    }

    InstanceAction::None
}
