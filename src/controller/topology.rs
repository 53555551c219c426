//! Topology planning: which instance is primary and how to get there
//!
//! [`plan_topology`] is a pure function of the registry, the cluster status
//! and what the instances report. It returns the single next step; the
//! reconciler applies it and the next pass re-plans from fresh observations.
//!
//! Promotion is driven by two status fields. `targetPrimary` differing from
//! `currentPrimary` means a promotion is in flight; the literal `pending`
//! marks a failover whose candidate has not been elected yet.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controller::fencing::FencedInstances;
use crate::controller::registry::{Instance, InstanceRegistry};
use crate::crd::{PENDING_FAILOVER_MARKER, PostgresClusterStatus, PromotionKind};
use crate::postgres::{InstanceStatus, Lsn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyAction {
    /// Nothing to do
    Steady,
    /// No primary recorded and none has come up yet
    WaitForBootstrap,
    /// The first instance finished bootstrap; record it as primary
    AdoptPrimary { instance: String },
    /// The primary just became unhealthy; record when
    MarkPrimaryFailing,
    /// The primary is healthy again
    ClearPrimaryFailing,
    /// The fence on an unhealthy primary was just lifted; record when
    MarkFenceLifted { instance: String },
    /// The primary is restarting after its fence was lifted
    AwaitFencedPrimary { instance: String, remaining: Duration },
    /// Within `failoverDelay` of the primary failing
    AwaitFailoverDelay { remaining: Duration },
    /// Set `targetPrimary = pending`
    BeginFailover { from: String, reason: String },
    /// A candidate still streams WAL; give it time to finish replay
    WaitForWalReceivers { instances: Vec<String> },
    /// Set `targetPrimary` to the elected standby
    ElectPrimary { instance: String, replay_lsn: Option<Lsn> },
    /// The old primary came back before any standby was eligible
    CancelFailover,
    /// Failover found no eligible standby
    NoEligibleStandby { reason: String },
    /// Planned promotion away from a primary on a draining node
    BeginSwitchover { target: String, reason: String },
    /// Shut the old primary down before promoting the target
    Demote { instance: String },
    /// Ask the target to leave recovery
    Promote { instance: String },
    /// The target left recovery; record it as `currentPrimary`
    CompletePromotion { instance: String, timeline: Option<u32> },
    /// The switchover target became unusable
    AbortSwitchover { reason: String },
    /// The elected failover target became unusable; elect again
    RestartElection { reason: String },
}

/// Observations the planner works from
pub struct TopologyInput<'a> {
    pub registry: &'a InstanceRegistry,
    pub status: &'a PostgresClusterStatus,
    pub fenced: &'a FencedInstances,
    /// Instances that answered a status probe this pass
    pub probes: &'a BTreeMap<String, InstanceStatus>,
    pub failover_delay: Duration,
    pub wal_receiver_timeout: Duration,
    /// How long a primary whose fence was lifted may take to come back
    pub fence_recovery_timeout: Duration,
    pub now: DateTime<Utc>,
}

impl TopologyInput<'_> {
    fn elapsed_since(&self, timestamp: Option<&str>) -> Option<Duration> {
        let since = DateTime::parse_from_rfc3339(timestamp?).ok()?;
        (self.now - since.with_timezone(&Utc)).to_std().ok().or(Some(Duration::ZERO))
    }

    /// Ready, unfenced, reachable and not on its way out
    fn is_eligible(&self, instance: &Instance) -> bool {
        instance.is_healthy()
            && !self.fenced.is_fenced(&instance.name)
            && self.probes.contains_key(&instance.name)
    }

    /// Fenced, or under disk pressure, as of the previous pass
    fn was_fenced(&self, instance: &str) -> bool {
        let status = self.status;
        FencedInstances::from_names(status.fenced_instances.iter().map(String::as_str)).is_fenced(instance)
            || status.disk_pressure_instances.iter().any(|i| i == instance)
    }

    fn primary_healthy(&self, primary: &str) -> bool {
        self.registry.get(primary).is_some_and(Instance::is_healthy)
    }
}

pub fn plan_topology(input: &TopologyInput<'_>) -> TopologyAction {
    let status = input.status;

    let Some(current) = status.current_primary.as_deref() else {
        return plan_bootstrap(input);
    };

    match status.target_primary.as_deref() {
        Some(PENDING_FAILOVER_MARKER) => plan_election(input, current),
        Some(target) if target != current => plan_promotion(input, current, target),
        _ => plan_steady(input, current),
    }
}

fn plan_bootstrap(input: &TopologyInput<'_>) -> TopologyAction {
    let adopted = input.registry.iter().find(|i| {
        i.is_healthy() && input.probes.get(&i.name).is_some_and(|p| p.is_primary)
    });
    match adopted {
        Some(instance) => TopologyAction::AdoptPrimary {
            instance: instance.name.clone(),
        },
        None => TopologyAction::WaitForBootstrap,
    }
}

fn plan_steady(input: &TopologyInput<'_>, current: &str) -> TopologyAction {
    let status = input.status;

    // A fenced primary is stopped on purpose and is never failed over
    if input.fenced.is_fenced(current) {
        if status.primary_failing_since.is_some() || status.fence_lifted_at.is_some() {
            return TopologyAction::ClearPrimaryFailing;
        }
        return TopologyAction::Steady;
    }

    if !input.primary_healthy(current) {
        if let Some(action) = plan_fence_recovery(input, current) {
            return action;
        }
        let Some(failing_for) = input.elapsed_since(status.primary_failing_since.as_deref()) else {
            return TopologyAction::MarkPrimaryFailing;
        };
        if failing_for < input.failover_delay {
            return TopologyAction::AwaitFailoverDelay {
                remaining: input.failover_delay - failing_for,
            };
        }
        let reason = match input.registry.get(current) {
            None => "primary pod is missing".to_string(),
            Some(i) if i.evicted => "primary pod was evicted".to_string(),
            Some(i) if i.deleting => "primary pod is being deleted".to_string(),
            Some(_) => "primary pod is not ready".to_string(),
        };
        return TopologyAction::BeginFailover {
            from: current.to_string(),
            reason,
        };
    }

    if status.primary_failing_since.is_some() || status.fence_lifted_at.is_some() {
        return TopologyAction::ClearPrimaryFailing;
    }

    if input.registry.get(current).is_some_and(|i| i.node_draining) {
        let candidate = most_advanced(
            input
                .registry
                .standbys(Some(current))
                .filter(|i| input.is_eligible(i) && !i.node_draining),
            input.probes,
        );
        if let Some((instance, _)) = candidate {
            return TopologyAction::BeginSwitchover {
                target: instance.name.clone(),
                reason: format!("node of primary {} is draining", current),
            };
        }
    }

    TopologyAction::Steady
}

/// Give a primary whose fence was lifted time to restart
///
/// Returns `None` once the recovery window is over, so the usual failover
/// path takes it from there.
fn plan_fence_recovery(input: &TopologyInput<'_>, current: &str) -> Option<TopologyAction> {
    match input.elapsed_since(input.status.fence_lifted_at.as_deref()) {
        None if input.was_fenced(current) => Some(TopologyAction::MarkFenceLifted {
            instance: current.to_string(),
        }),
        None => None,
        Some(waited) if waited < input.fence_recovery_timeout => Some(TopologyAction::AwaitFencedPrimary {
            instance: current.to_string(),
            remaining: input.fence_recovery_timeout - waited,
        }),
        Some(_) => None,
    }
}

fn plan_election(input: &TopologyInput<'_>, current: &str) -> TopologyAction {
    let candidates: Vec<&Instance> = input
        .registry
        .standbys(Some(current))
        .filter(|i| input.is_eligible(i))
        .collect();

    if candidates.is_empty() {
        if input.primary_healthy(current) {
            return TopologyAction::CancelFailover;
        }
        return TopologyAction::NoEligibleStandby {
            reason: "no ready, unfenced and reachable standby".to_string(),
        };
    }

    let requested_at = input
        .status
        .promotion
        .as_ref()
        .map(|p| p.requested_at.as_str());
    let waited = input.elapsed_since(requested_at).unwrap_or(Duration::MAX);
    if waited < input.wal_receiver_timeout {
        let streaming: Vec<String> = candidates
            .iter()
            .filter(|i| input.probes.get(&i.name).is_some_and(|p| p.wal_receiver_active))
            .map(|i| i.name.clone())
            .collect();
        if !streaming.is_empty() {
            return TopologyAction::WaitForWalReceivers { instances: streaming };
        }
    }

    match most_advanced(candidates.into_iter(), input.probes) {
        Some((instance, replay_lsn)) => TopologyAction::ElectPrimary {
            instance: instance.name.clone(),
            replay_lsn,
        },
        None => TopologyAction::NoEligibleStandby {
            reason: "no standby reported a replay position".to_string(),
        },
    }
}

fn plan_promotion(input: &TopologyInput<'_>, current: &str, target: &str) -> TopologyAction {
    let is_failover = input
        .status
        .promotion
        .as_ref()
        .is_some_and(|p| p.kind == PromotionKind::Failover);

    if let Some(probe) = input.probes.get(target)
        && probe.is_primary
    {
        return TopologyAction::CompletePromotion {
            instance: target.to_string(),
            timeline: probe.timeline,
        };
    }

    let target_usable = input
        .registry
        .get(target)
        .is_some_and(|i| input.is_eligible(i));
    if !target_usable {
        let reason = format!("promotion target {} is no longer eligible", target);
        return if is_failover {
            TopologyAction::RestartElection { reason }
        } else {
            TopologyAction::AbortSwitchover { reason }
        };
    }

    // Never promote while the old primary still accepts writes
    if input.probes.get(current).is_some_and(|p| p.is_primary) {
        return TopologyAction::Demote {
            instance: current.to_string(),
        };
    }

    TopologyAction::Promote {
        instance: target.to_string(),
    }
}

/// Highest replay LSN wins; ties go to the lowest serial
pub fn most_advanced<'a>(
    candidates: impl Iterator<Item = &'a Instance>,
    probes: &BTreeMap<String, InstanceStatus>,
) -> Option<(&'a Instance, Option<Lsn>)> {
    candidates
        .map(|i| {
            let lsn = probes
                .get(&i.name)
                .and_then(|p| p.replay_lsn.or(p.receive_lsn));
            (i, lsn)
        })
        .max_by(|(a, a_lsn), (b, b_lsn)| {
            a_lsn
                .unwrap_or(Lsn::ZERO)
                .cmp(&b_lsn.unwrap_or(Lsn::ZERO))
                .then_with(|| b.serial.cmp(&a.serial))
        })
}
