//! HA replication slots
//!
//! The primary keeps one physical slot per standby so WAL a standby still
//! needs is never recycled. Each standby mirrors the primary's slots, except
//! its own, so a promoted standby already holds slots for its peers and a
//! demoted primary sheds slots nobody uses any more. Slot names are derived
//! from instance names.

use std::collections::BTreeSet;

use crate::postgres::{Lsn, ReplicationSlot};

/// Slot name for an instance: prefix plus the name with `-` as `_`
pub fn ha_slot_name(prefix: &str, instance: &str) -> String {
    format!("{}{}", prefix, instance.replace('-', "_"))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotPlan {
    pub create: Vec<String>,
    pub drop: Vec<String>,
    /// Extra slots still in use; dropped on a later pass
    pub retry: Vec<String>,
    /// Slots to move forward to the primary's restart position
    pub advance: Vec<(String, Lsn)>,
}

impl SlotPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.drop.is_empty() && self.advance.is_empty()
    }
}

fn diff(wanted: &BTreeSet<String>, prefix: &str, observed: &[ReplicationSlot]) -> SlotPlan {
    let present: BTreeSet<&str> = observed.iter().map(|s| s.name.as_str()).collect();

    let mut plan = SlotPlan {
        create: wanted
            .iter()
            .filter(|w| !present.contains(w.as_str()))
            .cloned()
            .collect(),
        ..Default::default()
    };

    for slot in observed {
        if !slot.name.starts_with(prefix) || wanted.contains(&slot.name) {
            continue;
        }
        if slot.active {
            plan.retry.push(slot.name.clone());
        } else {
            plan.drop.push(slot.name.clone());
        }
    }
    plan
}

/// Diff the slots on the primary against the standby set
///
/// With HA slots disabled every prefixed slot is unwanted.
pub fn plan_slot_changes<'a>(
    enabled: bool,
    prefix: &str,
    standbys: impl Iterator<Item = &'a str>,
    observed: &[ReplicationSlot],
) -> SlotPlan {
    let wanted: BTreeSet<String> = if enabled {
        standbys.map(|s| ha_slot_name(prefix, s)).collect()
    } else {
        BTreeSet::new()
    };
    diff(&wanted, prefix, observed)
}

/// Diff the slots on a standby against the primary's
///
/// Only primary slots that already reserve WAL are mirrored. Mirrored slots
/// that lag behind the primary's restart position are advanced so they do
/// not pin WAL on the standby.
pub fn plan_standby_slots(
    enabled: bool,
    prefix: &str,
    standby: &str,
    primary_slots: &[ReplicationSlot],
    observed: &[ReplicationSlot],
) -> SlotPlan {
    let own = ha_slot_name(prefix, standby);
    let mirrored: Vec<(&str, Lsn)> = if enabled {
        primary_slots
            .iter()
            .filter(|s| s.name.starts_with(prefix) && s.name != own)
            .filter_map(|s| s.restart_lsn.map(|lsn| (s.name.as_str(), lsn)))
            .collect()
    } else {
        Vec::new()
    };
    let wanted: BTreeSet<String> = mirrored.iter().map(|(name, _)| name.to_string()).collect();

    let mut plan = diff(&wanted, prefix, observed);
    for (name, lsn) in mirrored {
        let local = observed.iter().find(|s| s.name == name).and_then(|s| s.restart_lsn);
        if local.is_none_or(|l| l < lsn) {
            plan.advance.push((name.to_string(), lsn));
        }
    }
    plan
}
