//! ScheduledBackup policies
//!
//! - The schedule must parse as a six-field cron expression
//! - The cluster reference must name a cluster

use super::ValidationResult;
use crate::controller::scheduled_backup_reconciler::parse_schedule;
use crate::crd::ScheduledBackup;

pub fn validate_scheduled_backup(scheduled: &ScheduledBackup) -> ValidationResult {
    if scheduled.spec.cluster.name.is_empty() {
        return ValidationResult::denied("ClusterRequired", "spec.cluster.name must be set");
    }
    if let Err(e) = parse_schedule(&scheduled.spec.schedule) {
        return ValidationResult::denied("InvalidSchedule", &e.to_string());
    }
    ValidationResult::allowed()
}
