//! Formal finite state machine for PostgresCluster lifecycle management
//!
//! Phases only move along the transitions listed in the table below. The
//! triggering event is derived from observed facts by [`determine_event`],
//! so every reconcile pass computes the phase from scratch.

use std::fmt;

use tracing::{debug, info};

use crate::crd::ClusterPhase;

/// Events that trigger state transitions in the cluster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// The first instance pod exists
    InstancesCreated,
    /// Every desired instance is ready and the primary is serving
    AllInstancesReady,
    /// Some instances are not ready
    InstancesDegraded,
    /// The instance count differs from the spec
    ScaleRequested,
    /// At least one instance runs an outdated image
    ImageChanged,
    /// At least one PVC has not reached its desired size
    ResizeRequested,
    /// The primary is unhealthy and a failover was started
    PrimaryLost,
    /// A planned promotion was requested
    SwitchoverRequested,
    /// Failover cannot elect any standby
    NoEligibleStandby,
    /// An instance was fenced because its volume is full
    DiskExhausted,
    /// The recovery plan could not be verified
    RecoveryPlanFailed,
    /// A previously failing recovery plan now verifies
    RecoveryPlanVerified,
    /// Deletion timestamp has been set on the resource
    DeletionRequested,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::InstancesCreated => write!(f, "InstancesCreated"),
            ClusterEvent::AllInstancesReady => write!(f, "AllInstancesReady"),
            ClusterEvent::InstancesDegraded => write!(f, "InstancesDegraded"),
            ClusterEvent::ScaleRequested => write!(f, "ScaleRequested"),
            ClusterEvent::ImageChanged => write!(f, "ImageChanged"),
            ClusterEvent::ResizeRequested => write!(f, "ResizeRequested"),
            ClusterEvent::PrimaryLost => write!(f, "PrimaryLost"),
            ClusterEvent::SwitchoverRequested => write!(f, "SwitchoverRequested"),
            ClusterEvent::NoEligibleStandby => write!(f, "NoEligibleStandby"),
            ClusterEvent::DiskExhausted => write!(f, "DiskExhausted"),
            ClusterEvent::RecoveryPlanFailed => write!(f, "RecoveryPlanFailed"),
            ClusterEvent::RecoveryPlanVerified => write!(f, "RecoveryPlanVerified"),
            ClusterEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Facts observed during a reconcile pass
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub ready_instances: i32,
    pub desired_instances: i32,
    /// Instance pods that currently exist
    pub existing_instances: i32,
    /// The current primary exists and is ready
    pub primary_ready: bool,
    /// targetPrimary is the pending marker or a failover promotion is running
    pub failover_in_progress: bool,
    /// targetPrimary differs from currentPrimary for a planned promotion
    pub switchover_in_progress: bool,
    /// Failover found no ready, unfenced, reachable standby
    pub no_eligible_standby: bool,
    /// An instance is fenced for disk pressure
    pub disk_pressure: bool,
    /// Some PVC is not UpToDate
    pub resize_pending: bool,
    /// Some instance runs an image other than the spec's
    pub image_outdated: bool,
    /// Recovery bootstrap was requested and the plan failed
    pub recovery_failed: bool,
}

impl TransitionContext {
    pub fn new(ready_instances: i32, desired_instances: i32) -> Self {
        Self {
            ready_instances,
            desired_instances,
            existing_instances: ready_instances,
            primary_ready: ready_instances > 0,
            ..Default::default()
        }
    }

    pub fn all_instances_ready(&self) -> bool {
        self.primary_ready
            && self.ready_instances >= self.desired_instances
            && self.existing_instances == self.desired_instances
    }

    pub fn is_degraded(&self) -> bool {
        self.ready_instances < self.desired_instances
    }

    pub fn scale_needed(&self) -> bool {
        self.existing_instances != self.desired_instances
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterPhase,
    pub to: ClusterPhase,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after applying the result to `current`
    pub fn next_phase(&self, current: ClusterPhase) -> ClusterPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Phases a cluster may be in while serving or converging
const ACTIVE_PHASES: [ClusterPhase; 9] = [
    ClusterPhase::Initializing,
    ClusterPhase::Ready,
    ClusterPhase::Scaling,
    ClusterPhase::Upgrading,
    ClusterPhase::Resizing,
    ClusterPhase::FailingOver,
    ClusterPhase::Switchover,
    ClusterPhase::Degraded,
    ClusterPhase::NotEnoughDiskSpace,
];

/// Formal state machine for PostgresCluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use ClusterEvent as E;
        use ClusterPhase as P;

        let mut transitions = vec![
            // === Bootstrap ===
            Transition::new(P::Pending, P::Initializing, E::InstancesCreated, "First instance created"),
            Transition::new(P::Pending, P::RecoveryFailed, E::RecoveryPlanFailed, "Recovery target could not be resolved"),
            Transition::new(P::Initializing, P::RecoveryFailed, E::RecoveryPlanFailed, "Recovery target could not be resolved"),
            Transition::new(P::RecoveryFailed, P::Pending, E::RecoveryPlanVerified, "Recovery plan verified, retrying bootstrap"),
            Transition::new(P::Initializing, P::Scaling, E::ScaleRequested, "Primary bootstrapped, adding standbys"),
            // === Failover ===
            Transition::new(P::FailingOver, P::Degraded, E::NoEligibleStandby, "No standby eligible for promotion"),
            Transition::new(P::FailingOver, P::NotEnoughDiskSpace, E::DiskExhausted, "Instance fenced during failover"),
            // === Switchover ===
            Transition::new(P::Switchover, P::FailingOver, E::PrimaryLost, "Primary lost during switchover"),
        ];

        // Convergence back to Ready
        for from in ACTIVE_PHASES {
            if from != P::Ready {
                transitions.push(Transition::new(from, P::Ready, E::AllInstancesReady, "All instances ready"));
            }
        }

        // Operations that start from a settled cluster
        for from in [P::Ready, P::Degraded, P::Resizing, P::Upgrading, P::Scaling, P::NotEnoughDiskSpace] {
            if from != P::Scaling {
                transitions.push(Transition::new(from, P::Scaling, E::ScaleRequested, "Instance count changed"));
            }
            if from != P::Upgrading {
                transitions.push(Transition::new(from, P::Upgrading, E::ImageChanged, "Image changed, rolling instances"));
            }
            if from != P::Resizing {
                transitions.push(Transition::new(from, P::Resizing, E::ResizeRequested, "Volume resize in progress"));
            }
            transitions.push(Transition::new(from, P::Switchover, E::SwitchoverRequested, "Switchover requested"));
        }

        for from in [P::Ready, P::Initializing] {
            transitions.push(Transition::new(from, P::Degraded, E::InstancesDegraded, "Some instances are not ready"));
        }

        for from in ACTIVE_PHASES {
            if from != P::FailingOver && from != P::Switchover {
                transitions.push(Transition::new(from, P::FailingOver, E::PrimaryLost, "Primary lost, failing over"));
            }
            if from != P::NotEnoughDiskSpace && from != P::FailingOver {
                transitions.push(Transition::new(from, P::NotEnoughDiskSpace, E::DiskExhausted, "Instance fenced for disk pressure"));
            }
        }

        // Deletion from any state; Deleting is terminal
        for from in ACTIVE_PHASES.into_iter().chain([P::Pending, P::RecoveryFailed]) {
            transitions.push(Transition::new(from, P::Deleting, E::DeletionRequested, "Cluster deletion requested"));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ClusterPhase, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ClusterPhase) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            (ClusterPhase::Ready, ClusterEvent::AllInstancesReady) => {
                if !ctx.all_instances_ready() {
                    Some(format!(
                        "Not all instances ready: {}/{}",
                        ctx.ready_instances, ctx.desired_instances
                    ))
                } else if ctx.resize_pending || ctx.image_outdated || ctx.disk_pressure {
                    Some("Volumes or images still converging".to_string())
                } else {
                    None
                }
            }
            (ClusterPhase::Degraded, ClusterEvent::InstancesDegraded) => {
                if !ctx.is_degraded() {
                    Some(format!(
                        "Cluster is not degraded: {}/{} instances ready",
                        ctx.ready_instances, ctx.desired_instances
                    ))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Derive the event for this pass from observed facts
///
/// Returns `None` when nothing warrants a phase change.
pub fn determine_event(
    current_phase: &ClusterPhase,
    ctx: &TransitionContext,
    has_deletion_timestamp: bool,
) -> Option<ClusterEvent> {
    // Deletion always takes priority
    if has_deletion_timestamp {
        return Some(ClusterEvent::DeletionRequested);
    }

    if ctx.recovery_failed {
        return Some(ClusterEvent::RecoveryPlanFailed);
    }
    if *current_phase == ClusterPhase::RecoveryFailed {
        return Some(ClusterEvent::RecoveryPlanVerified);
    }

    if ctx.disk_pressure && *current_phase != ClusterPhase::NotEnoughDiskSpace {
        return Some(ClusterEvent::DiskExhausted);
    }

    if ctx.failover_in_progress {
        return Some(if ctx.no_eligible_standby {
            ClusterEvent::NoEligibleStandby
        } else {
            ClusterEvent::PrimaryLost
        });
    }

    if ctx.switchover_in_progress {
        return Some(ClusterEvent::SwitchoverRequested);
    }

    if *current_phase == ClusterPhase::Pending {
        return (ctx.existing_instances > 0).then_some(ClusterEvent::InstancesCreated);
    }

    if *current_phase == ClusterPhase::Initializing && !ctx.primary_ready {
        return None;
    }

    if ctx.scale_needed() {
        return Some(ClusterEvent::ScaleRequested);
    }
    if ctx.image_outdated {
        return Some(ClusterEvent::ImageChanged);
    }
    if ctx.resize_pending {
        return Some(ClusterEvent::ResizeRequested);
    }

    if ctx.all_instances_ready() && !ctx.disk_pressure {
        return Some(ClusterEvent::AllInstancesReady);
    }

    if ctx.is_degraded() {
        return Some(ClusterEvent::InstancesDegraded);
    }

    None
}

/// Phase and reason to record after this pass
///
/// Phases that have no transition for the observed event keep their
/// previous reason.
pub fn advance_phase(
    current: ClusterPhase,
    previous_reason: Option<&str>,
    ctx: &TransitionContext,
) -> (ClusterPhase, String) {
    let keep = || previous_reason.unwrap_or_default().to_string();
    let Some(event) = determine_event(&current, ctx, false) else {
        return (current, keep());
    };

    let result = ClusterStateMachine::new().transition(&current, event, ctx);
    let reason = match &result {
        TransitionResult::Success { from, to, description, .. } => {
            if from != to {
                info!(from = %from, to = %to, "{}", description);
            }
            description.to_string()
        }
        TransitionResult::GuardFailed { reason, .. } => {
            debug!(reason = %reason, "phase transition blocked");
            keep()
        }
        TransitionResult::InvalidTransition { current, event } => {
            debug!(phase = %current, event = ?event, "no transition for event");
            keep()
        }
    };
    (result.next_phase(current), reason)
}
