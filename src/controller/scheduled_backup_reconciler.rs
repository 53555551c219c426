//! Reconciliation of ScheduledBackup objects
//!
//! Each pass compares the cron schedule against `lastCheckTime`. All ticks
//! missed since then, including a whole suspended window, collapse into a
//! single backup. Backup names derive from the tick they stand for, so a
//! retried create hits `AlreadyExists` instead of duplicating.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{
    Backup, BackupOwnerReference, BackupSpec, PostgresCluster, ScheduledBackup, ScheduledBackupStatus,
};
use crate::resources::common::{
    FIELD_MANAGER, LABEL_BACKUP_CLUSTER, LABEL_IMMEDIATE_BACKUP, LABEL_SCHEDULED_BACKUP, owner_reference,
};

/// Upper bound on the wait between checks
const MAX_REQUEUE: Duration = Duration::from_secs(3600);

/// Parse a six-field cron expression (seconds first)
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression)
        .map_err(|e| Error::ValidationError(format!("invalid schedule '{}': {}", expression, e)))
}

/// Outcome of one schedule check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulePlan {
    /// Tick to back up now
    pub scheduled: Option<DateTime<Utc>>,
    /// Take the one-off backup requested by `immediate`
    pub immediate: bool,
    pub next: Option<DateTime<Utc>>,
    /// New `lastCheckTime`; `None` leaves it untouched
    pub checked_at: Option<DateTime<Utc>>,
}

impl SchedulePlan {
    pub fn backups(&self) -> usize {
        usize::from(self.immediate) + usize::from(self.scheduled.is_some())
    }
}

/// Decide which backups a check at `now` should create
///
/// A suspended schedule does nothing and keeps `lastCheckTime`, so the
/// first check after resuming sees the missed ticks and fires once.
pub fn plan_schedule(
    schedule: &Schedule,
    suspend: bool,
    immediate: bool,
    last_check: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SchedulePlan {
    if suspend {
        return SchedulePlan {
            scheduled: None,
            immediate: false,
            next: None,
            checked_at: None,
        };
    }

    let next = schedule.after(&now).next();
    let Some(last_check) = last_check else {
        return SchedulePlan {
            scheduled: None,
            immediate,
            next,
            checked_at: Some(now),
        };
    };

    let scheduled = schedule
        .after(&last_check)
        .take_while(|tick| *tick <= now)
        .last();

    SchedulePlan {
        scheduled,
        immediate: false,
        next,
        checked_at: Some(now),
    }
}

/// `<schedule>-<yyyymmddhhmmss>`
pub fn backup_name(scheduled_backup: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", scheduled_backup, at.format("%Y%m%d%H%M%S"))
}

/// Backup object for one tick of a schedule
pub fn generate_backup(
    scheduled: &ScheduledBackup,
    at: DateTime<Utc>,
    immediate: bool,
    owner: Option<OwnerReference>,
) -> Backup {
    let sb_name = scheduled.name_any();
    let mut labels = std::collections::BTreeMap::from([
        (LABEL_SCHEDULED_BACKUP.to_string(), sb_name.clone()),
        (LABEL_BACKUP_CLUSTER.to_string(), scheduled.spec.cluster.name.clone()),
    ]);
    if immediate {
        labels.insert(LABEL_IMMEDIATE_BACKUP.to_string(), "true".to_string());
    }

    Backup {
        metadata: ObjectMeta {
            name: Some(backup_name(&sb_name, at)),
            namespace: scheduled.namespace(),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: BackupSpec {
            cluster: scheduled.spec.cluster.clone(),
            target: scheduled.spec.target,
        },
        status: None,
    }
}

#[instrument(skip(scheduled, ctx), fields(scheduled_backup = %scheduled.name_any(), namespace = scheduled.namespace().unwrap_or_default()))]
pub async fn reconcile_scheduled_backup(scheduled: Arc<ScheduledBackup>, ctx: Arc<Context>) -> Result<Action> {
    let ns = scheduled.namespace().unwrap_or_default();
    let name = scheduled.name_any();
    let schedule = parse_schedule(&scheduled.spec.schedule)?;
    let status = scheduled.status.clone().unwrap_or_default();
    let now = Utc::now();

    let last_check = status
        .last_check_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    let plan = plan_schedule(
        &schedule,
        scheduled.spec.suspend,
        scheduled.spec.immediate,
        last_check,
        now,
    );

    if scheduled.spec.suspend {
        info!("schedule suspended");
        return Ok(Action::await_change());
    }

    if plan.backups() > 0 {
        let owner = backup_owner(&scheduled, &ctx, &ns).await?;
        if plan.immediate {
            // Named after the object's creation so a retry reuses the name
            let at = scheduled
                .meta()
                .creation_timestamp
                .as_ref()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.0.as_second(), 0))
                .unwrap_or(now);
            create_backup(&ctx, &ns, &generate_backup(&scheduled, at, true, owner.clone())).await?;
        }
        if let Some(tick) = plan.scheduled {
            create_backup(&ctx, &ns, &generate_backup(&scheduled, tick, false, owner)).await?;
        }
    }

    let mut new_status = ScheduledBackupStatus {
        last_check_time: plan.checked_at.map(|t| t.to_rfc3339()).or(status.last_check_time),
        last_schedule_time: status.last_schedule_time,
        next_schedule_time: plan.next.map(|t| t.to_rfc3339()),
    };
    if let Some(tick) = plan.scheduled {
        new_status.last_schedule_time = Some(tick.to_rfc3339());
    }
    let api: Api<ScheduledBackup> = Api::namespaced(ctx.client.clone(), &ns);
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "status": new_status })),
    )
    .await?;

    let wait = plan
        .next
        .and_then(|next| (next - now).to_std().ok())
        .unwrap_or(MAX_REQUEUE)
        .clamp(Duration::from_secs(1), MAX_REQUEUE);
    Ok(Action::requeue(wait))
}

pub fn scheduled_backup_error_policy(scheduled: Arc<ScheduledBackup>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(scheduled_backup = %scheduled.name_any(), error = %error, "schedule check failed, requeuing in {:?}", delay);
    Action::requeue(delay)
}

async fn backup_owner(scheduled: &ScheduledBackup, ctx: &Context, ns: &str) -> Result<Option<OwnerReference>> {
    match scheduled.spec.backup_owner_reference {
        BackupOwnerReference::None => Ok(None),
        BackupOwnerReference::SelfRef => Ok(scheduled.controller_owner_ref(&())),
        BackupOwnerReference::Cluster => {
            let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), ns);
            let cluster = clusters.get(&scheduled.spec.cluster.name).await?;
            Ok(Some(owner_reference(&cluster)))
        }
    }
}

async fn create_backup(ctx: &Context, ns: &str, backup: &Backup) -> Result<()> {
    let api: Api<Backup> = Api::namespaced(ctx.client.clone(), ns);
    let name = backup.name_any();
    match api.create(&PostParams::default(), backup).await {
        Ok(_) => {
            info!(backup = %name, "created scheduled backup");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            info!(backup = %name, "backup already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
