//! Scheduled backup planning

use pgha_operator::controller::scheduled_backup_reconciler::{
    backup_name, generate_backup, parse_schedule, plan_schedule,
};
use pgha_operator::crd::{LocalObjectReference, ScheduledBackup, ScheduledBackupSpec};
use pgha_operator::resources::common::LABEL_BACKUP_CLUSTER;
use kube::ResourceExt;

use crate::common::*;

/// Every day at 02:00:00
const NIGHTLY: &str = "0 0 2 * * *";

fn scheduled() -> ScheduledBackup {
    let mut sb = ScheduledBackup::new(
        "nightly",
        ScheduledBackupSpec {
            schedule: NIGHTLY.to_string(),
            cluster: LocalObjectReference {
                name: "pg".to_string(),
            },
            suspend: false,
            immediate: false,
            target: None,
            backup_owner_reference: Default::default(),
        },
    );
    sb.metadata.namespace = Some("default".to_string());
    sb
}

#[test]
fn test_first_check_only_records_time() {
    let schedule = parse_schedule(NIGHTLY).unwrap();
    let now = ts("2026-05-01T10:00:00Z");
    let plan = plan_schedule(&schedule, false, false, None, now);
    assert_eq!(plan.scheduled, None);
    assert_eq!(plan.checked_at, Some(now));
    assert_eq!(plan.next, Some(ts("2026-05-02T02:00:00Z")));
    assert_eq!(plan.backups(), 0);

    let immediate = plan_schedule(&schedule, false, true, None, now);
    assert!(immediate.immediate);
    assert_eq!(immediate.backups(), 1);
}

#[test]
fn test_tick_between_checks_fires() {
    let schedule = parse_schedule(NIGHTLY).unwrap();
    let plan = plan_schedule(
        &schedule,
        false,
        true,
        Some(ts("2026-05-01T01:59:00Z")),
        ts("2026-05-01T02:00:05Z"),
    );
    assert_eq!(plan.scheduled, Some(ts("2026-05-01T02:00:00Z")));
    // immediate only applies to the first check
    assert!(!plan.immediate);
}

#[test]
fn test_no_tick_between_checks() {
    let schedule = parse_schedule(NIGHTLY).unwrap();
    let plan = plan_schedule(
        &schedule,
        false,
        false,
        Some(ts("2026-05-01T03:00:00Z")),
        ts("2026-05-01T04:00:00Z"),
    );
    assert_eq!(plan.scheduled, None);
    assert_eq!(plan.checked_at, Some(ts("2026-05-01T04:00:00Z")));
}

#[test]
fn test_resume_after_suspension_fires_once() {
    let schedule = parse_schedule(NIGHTLY).unwrap();
    let last_check = ts("2026-05-01T01:00:00Z");

    let suspended = plan_schedule(&schedule, true, false, Some(last_check), ts("2026-05-03T12:00:00Z"));
    assert_eq!(suspended.backups(), 0);
    assert_eq!(suspended.checked_at, None);
    assert_eq!(suspended.next, None);

    // Three ticks were missed; only the latest is taken
    let resumed = plan_schedule(&schedule, false, false, Some(last_check), ts("2026-05-03T12:00:00Z"));
    assert_eq!(resumed.scheduled, Some(ts("2026-05-03T02:00:00Z")));
    assert_eq!(resumed.backups(), 1);
}

#[test]
fn test_rejects_five_field_cron() {
    assert!(parse_schedule("0 2 * * *").is_err());
}

#[test]
fn test_generated_backup() {
    let at = ts("2026-05-01T02:00:00Z");
    assert_eq!(backup_name("nightly", at), "nightly-20260501020000");

    let backup = generate_backup(&scheduled(), at, false, None);
    assert_eq!(backup.name_any(), "nightly-20260501020000");
    assert_eq!(backup.namespace().as_deref(), Some("default"));
    assert_eq!(backup.spec.cluster.name, "pg");
    assert_eq!(backup.labels().get(LABEL_BACKUP_CLUSTER).map(String::as_str), Some("pg"));
    assert!(backup.owner_references().is_empty());
}
