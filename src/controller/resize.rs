//! Storage resize coordination
//!
//! Every decision is derived from the PVC objects themselves: the requested
//! size, the reported capacity and the resize conditions. A pass after an
//! operator restart therefore makes the same patches as the pass before it,
//! and a request is only ever raised.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::controller::error::{Error, Result};
use crate::crd::{AutoResizeEvent, PvcRole, ResizeConfiguration, ResizeState, VolumeResizeStatus};
use crate::postgres::{VolumeUsage, WalHealth};
use crate::resources::quantity::{format_quantity, parse_quantity, round_up_to_mi};

/// Window `maxActionsPerDay` is counted over
pub const BUDGET_WINDOW_HOURS: i64 = 24;
/// Events older than this are dropped from status
pub const EVENT_RETENTION_HOURS: i64 = 25;
pub const MAX_RESIZE_EVENTS: usize = 50;

pub const REASON_AUTO_RESIZE_SUCCESS: &str = "AutoResizeSuccess";
pub const REASON_AUTO_RESIZE_BLOCKED: &str = "AutoResizeBlocked";
pub const REASON_AUTO_RESIZE_AT_LIMIT: &str = "AutoResizeAtLimit";
pub const REASON_AUTO_RESIZE_WAL_RISK: &str = "AutoResizeWALRisk";
pub const REASON_WAL_HEALTH_UNAVAILABLE: &str = "AutoResizeWALHealthUnavailable";

/// Observed state of one PVC
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvcObservation {
    pub pvc_name: String,
    pub instance: String,
    pub role: PvcRole,
    pub requested: u64,
    pub capacity: Option<u64>,
    pub resizing: bool,
    pub fs_resize_pending: bool,
}

/// Resize decision for one PVC
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvcPlan {
    pub status: VolumeResizeStatus,
    /// New request to patch, when the current one is too small
    pub patch_to: Option<u64>,
}

/// Compare a PVC against the size the spec asks for
///
/// The desired size never drops below the current request, so lowering the
/// spec mid-resize keeps the in-flight request.
pub fn plan_pvc(observed: &PvcObservation, spec_size: u64) -> PvcPlan {
    let desired = spec_size.max(observed.requested);
    let patch_to = (observed.requested < spec_size).then_some(spec_size);
    let requested = patch_to.unwrap_or(observed.requested);

    let state = if patch_to.is_some() {
        ResizeState::Pending
    } else if observed.fs_resize_pending {
        ResizeState::FileSystemResizePending
    } else if observed.resizing || observed.capacity.is_some_and(|c| c < requested) {
        ResizeState::Resizing
    } else {
        ResizeState::UpToDate
    };

    PvcPlan {
        status: VolumeResizeStatus {
            pvc_name: observed.pvc_name.clone(),
            instance: observed.instance.clone(),
            role: observed.role,
            desired: format_quantity(desired),
            requested: format_quantity(requested),
            capacity: observed.capacity.map(format_quantity),
            state,
        },
        patch_to,
    }
}

/// Size for a PVC of a new instance: the largest request already in use
pub fn size_for_new_pvc(spec_size: u64, existing_requests: impl Iterator<Item = u64>) -> u64 {
    existing_requests.fold(spec_size, u64::max)
}

/// How much a volume grows per automatic action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpansionStep {
    Percent(u32),
    Absolute(u64),
}

impl ExpansionStep {
    pub fn parse(step: &str) -> Result<Self> {
        let step = step.trim();
        if let Some(pct) = step.strip_suffix('%') {
            let pct: u32 = pct
                .trim()
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid percentage step '{}'", step)))?;
            if pct == 0 {
                return Err(Error::InvalidConfig("expansion step must be positive".to_string()));
            }
            return Ok(Self::Percent(pct));
        }
        if !step.is_empty() && step.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidConfig(format!(
                "expansion step '{}' needs a '%' or a unit suffix",
                step
            )));
        }
        let bytes = parse_quantity(step)?;
        if bytes == 0 {
            return Err(Error::InvalidConfig("expansion step must be positive".to_string()));
        }
        Ok(Self::Absolute(bytes))
    }
}

/// Compute the grown size, capped at `limit`
///
/// Percentage steps are clamped to `[min_step, max_step]`.
pub fn expanded_size(current: u64, config: &ResizeConfiguration) -> Result<u64> {
    let expansion = &config.expansion;
    let step = match ExpansionStep::parse(&expansion.step)? {
        ExpansionStep::Percent(pct) => {
            let raw = u64::try_from(u128::from(current) * u128::from(pct) / 100).unwrap_or(u64::MAX);
            let min_step = parse_quantity(&expansion.min_step)?;
            let max_step = parse_quantity(&expansion.max_step)?;
            round_up_to_mi(raw.clamp(min_step, max_step.max(min_step)))
        }
        ExpansionStep::Absolute(bytes) => bytes,
    };

    let grown = current.saturating_add(step);
    match &expansion.limit {
        Some(limit) => Ok(grown.min(parse_quantity(limit)?)),
        None => Ok(grown),
    }
}

/// A Kubernetes event to emit for an auto-resize decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResizeEvent {
    pub reason: &'static str,
    pub warning: bool,
    pub message: String,
}

impl ResizeEvent {
    fn normal(reason: &'static str, message: String) -> Self {
        Self { reason, warning: false, message }
    }

    fn warning(reason: &'static str, message: String) -> Self {
        Self { reason, warning: true, message }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutoResizeDecision {
    /// Usage is below every trigger
    NotTriggered,
    /// Triggered but not allowed
    Blocked(ResizeEvent),
    /// Already at the configured limit
    AtLimit(ResizeEvent),
    /// Raise the request to `to`
    Resize { to: u64, events: Vec<ResizeEvent> },
}

/// Inputs for one auto-resize evaluation
pub struct AutoResizeInput<'a> {
    pub pvc_name: &'a str,
    pub role: PvcRole,
    /// The cluster keeps WAL on the data volume
    pub single_volume: bool,
    pub config: &'a ResizeConfiguration,
    pub usage: &'a VolumeUsage,
    pub requested: u64,
    pub history: &'a [AutoResizeEvent],
    pub wal_health: Option<&'a WalHealth>,
    pub now: DateTime<Utc>,
}

impl AutoResizeInput<'_> {
    fn holds_wal(&self) -> bool {
        self.role == PvcRole::Wal || self.single_volume
    }
}

/// True when usage crosses `usageThreshold` or free space is below `minAvailable`
pub fn is_triggered(config: &ResizeConfiguration, usage: &VolumeUsage) -> Result<bool> {
    let threshold = u8::try_from(config.triggers.usage_threshold.clamp(0, 100)).unwrap_or(100);
    if usage.total_bytes > 0 && usage.percent_used() >= threshold {
        return Ok(true);
    }
    if let Some(min_available) = &config.triggers.min_available {
        return Ok(usage.available_bytes < parse_quantity(min_available)?);
    }
    Ok(false)
}

/// Count resize actions on a PVC inside the budget window
pub fn actions_in_window(history: &[AutoResizeEvent], pvc_name: &str, now: DateTime<Utc>) -> usize {
    let window_start = now - ChronoDuration::hours(BUDGET_WINDOW_HOURS);
    history
        .iter()
        .filter(|e| e.pvc_name == pvc_name)
        .filter_map(|e| DateTime::parse_from_rfc3339(&e.timestamp).ok())
        .filter(|t| t.with_timezone(&Utc) > window_start)
        .count()
}

/// Record a resize, pruning old entries and capping the list
pub fn append_resize_event(history: &mut Vec<AutoResizeEvent>, event: AutoResizeEvent, now: DateTime<Utc>) {
    let cutoff = now - ChronoDuration::hours(EVENT_RETENTION_HOURS);
    history.retain(|e| {
        DateTime::parse_from_rfc3339(&e.timestamp).is_ok_and(|t| t.with_timezone(&Utc) > cutoff)
    });
    history.push(event);
    if history.len() > MAX_RESIZE_EVENTS {
        let excess = history.len() - MAX_RESIZE_EVENTS;
        history.drain(..excess);
    }
}

/// Warnings to emit when allowed, the blocking event otherwise
type SafetyCheck = std::result::Result<Vec<ResizeEvent>, ResizeEvent>;

fn check_wal_safety(input: &AutoResizeInput<'_>) -> Result<SafetyCheck> {
    let policy = &input.config.strategy.wal_safety_policy;
    let blocked = |message: String| -> Result<SafetyCheck> {
        Ok(Err(ResizeEvent::warning(REASON_AUTO_RESIZE_BLOCKED, message)))
    };

    if input.single_volume && input.role == PvcRole::Data && !policy.acknowledge_wal_risk {
        return blocked(format!(
            "{} holds both data and WAL; set acknowledgeWALRisk to allow auto-resize",
            input.pvc_name
        ));
    }

    let Some(health) = input.wal_health else {
        return Ok(Ok(vec![ResizeEvent::warning(
            REASON_WAL_HEALTH_UNAVAILABLE,
            format!("WAL health of {} is unknown, resizing anyway", input.pvc_name),
        )]));
    };

    if policy.require_archive_healthy && !health.archive_healthy {
        return blocked(format!("WAL archiving is failing for {}", input.pvc_name));
    }

    if policy.max_pending_wal_files > 0
        && i64::from(health.pending_wal_files) > i64::from(policy.max_pending_wal_files)
    {
        return blocked(format!(
            "{} WAL files are waiting to be archived (max {})",
            health.pending_wal_files, policy.max_pending_wal_files
        ));
    }

    if let Some(max_retention) = &policy.max_slot_retention {
        let max_retention = parse_quantity(max_retention)?;
        if let Some(slot) = health.inactive_slots.iter().find(|s| s.retained_bytes > max_retention) {
            return blocked(format!(
                "inactive replication slot {} retains {} of WAL",
                slot.name,
                format_quantity(slot.retained_bytes)
            ));
        }
    }

    Ok(Ok(Vec::new()))
}

/// Decide whether a PVC should grow automatically
///
/// Callers only evaluate PVCs whose resize state is `UpToDate`.
pub fn evaluate_auto_resize(input: &AutoResizeInput<'_>) -> Result<AutoResizeDecision> {
    let config = input.config;
    if !config.enabled || !is_triggered(config, input.usage)? {
        return Ok(AutoResizeDecision::NotTriggered);
    }

    if let Some(limit) = &config.expansion.limit
        && input.requested >= parse_quantity(limit)?
    {
        return Ok(AutoResizeDecision::AtLimit(ResizeEvent::warning(
            REASON_AUTO_RESIZE_AT_LIMIT,
            format!("{} is at its limit of {}", input.pvc_name, limit),
        )));
    }

    let max_actions = usize::try_from(config.strategy.max_actions_per_day.max(0)).unwrap_or(0);
    let used = actions_in_window(input.history, input.pvc_name, input.now);
    if used >= max_actions {
        return Ok(AutoResizeDecision::Blocked(ResizeEvent::warning(
            REASON_AUTO_RESIZE_BLOCKED,
            format!(
                "{} reached {} auto-resize actions in 24h",
                input.pvc_name, max_actions
            ),
        )));
    }

    let mut events = Vec::new();
    if input.holds_wal() {
        match check_wal_safety(input)? {
            Ok(warnings) => events.extend(warnings),
            Err(blocked) => return Ok(AutoResizeDecision::Blocked(blocked)),
        }
    }

    let to = expanded_size(input.requested, config)?;
    if to <= input.requested {
        return Ok(AutoResizeDecision::AtLimit(ResizeEvent::warning(
            REASON_AUTO_RESIZE_AT_LIMIT,
            format!("{} cannot grow past {}", input.pvc_name, format_quantity(input.requested)),
        )));
    }

    events.push(ResizeEvent::normal(
        REASON_AUTO_RESIZE_SUCCESS,
        format!(
            "expanding {} from {} to {} ({}% used)",
            input.pvc_name,
            format_quantity(input.requested),
            format_quantity(to),
            input.usage.percent_used()
        ),
    ));
    if input.holds_wal() {
        events.push(ResizeEvent::warning(
            REASON_AUTO_RESIZE_WAL_RISK,
            format!("{} holds WAL; growth may hide an archiving or slot problem", input.pvc_name),
        ));
    }

    Ok(AutoResizeDecision::Resize { to, events })
}
