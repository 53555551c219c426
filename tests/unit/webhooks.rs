//! Admission policies evaluated together

use std::collections::BTreeMap;

use pgha_operator::crd::{LocalObjectReference, ScheduledBackup, ScheduledBackupSpec};
use pgha_operator::webhooks::policies::{ValidationContext, validate_all, validate_scheduled_backup};
use serde_json::json;

use crate::common::*;

fn production() -> BTreeMap<String, String> {
    BTreeMap::from([("env".to_string(), "production".to_string())])
}

fn production_ready() -> PostgresClusterBuilder {
    PostgresClusterBuilder::ha("pg", "prod")
        .with_backup("s3://backups/pg")
        .with_resources("2", "4Gi")
}

#[test]
fn test_create_in_default_namespace() {
    let cluster = PostgresClusterBuilder::new("pg", "default").build();
    let ctx = ValidationContext::new(&cluster, None, BTreeMap::new());
    assert!(ctx.is_create());
    assert!(validate_all(&ctx).allowed);
}

#[test]
fn test_invalid_spec_is_denied_first() {
    let cluster = production_ready().with_instances(0).build();
    let result = validate_all(&ValidationContext::new(&cluster, None, production()));
    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("InvalidSpec"));
}

#[test]
fn test_production_requirements() {
    let ok = production_ready().build();
    assert!(validate_all(&ValidationContext::new(&ok, None, production())).allowed);

    let single = production_ready().with_instances(1).build();
    let result = validate_all(&ValidationContext::new(&single, None, production()));
    assert_eq!(result.reason.as_deref(), Some("ProductionHARequired"));

    // Same cluster outside production is fine
    assert!(validate_all(&ValidationContext::new(&single, None, BTreeMap::new())).allowed);

    let no_backup = PostgresClusterBuilder::ha("pg", "prod")
        .with_resources("2", "4Gi")
        .build();
    let result = validate_all(&ValidationContext::new(&no_backup, None, production()));
    assert_eq!(result.reason.as_deref(), Some("ProductionBackupRequired"));

    let no_limits = PostgresClusterBuilder::ha("pg", "prod")
        .with_backup("s3://backups/pg")
        .build();
    let result = validate_all(&ValidationContext::new(&no_limits, None, production()));
    assert_eq!(result.reason.as_deref(), Some("ProductionResourceLimitsRequired"));
}

#[test]
fn test_update_rules() {
    let old = PostgresClusterBuilder::ha("pg", "default").build();

    let grown = PostgresClusterBuilder::ha("pg", "default")
        .with_storage("50Gi", None)
        .build();
    assert!(validate_all(&ValidationContext::new(&grown, Some(&old), BTreeMap::new())).allowed);

    let shrunk = PostgresClusterBuilder::ha("pg", "default")
        .with_storage("5Gi", None)
        .build();
    let result = validate_all(&ValidationContext::new(&shrunk, Some(&old), BTreeMap::new()));
    assert_eq!(result.reason.as_deref(), Some("ImmutableFieldChanged"));

    let rebootstrapped = PostgresClusterBuilder::ha("pg", "default")
        .with_spec(json!({ "bootstrap": { "initdb": { "database": "other" } } }))
        .build();
    let result = validate_all(&ValidationContext::new(&rebootstrapped, Some(&old), BTreeMap::new()));
    assert_eq!(result.reason.as_deref(), Some("ImmutableFieldChanged"));
}

#[test]
fn test_scheduled_backup_policy() {
    let scheduled = |schedule: &str, cluster: &str| {
        ScheduledBackup::new(
            "nightly",
            ScheduledBackupSpec {
                schedule: schedule.to_string(),
                cluster: LocalObjectReference {
                    name: cluster.to_string(),
                },
                suspend: false,
                immediate: true,
                target: None,
                backup_owner_reference: Default::default(),
            },
        )
    };
    assert!(validate_scheduled_backup(&scheduled("0 0 2 * * *", "pg")).allowed);

    let five_field = validate_scheduled_backup(&scheduled("0 2 * * *", "pg"));
    assert!(!five_field.allowed);
    assert_eq!(five_field.reason.as_deref(), Some("InvalidSchedule"));

    let no_cluster = validate_scheduled_backup(&scheduled("0 0 2 * * *", ""));
    assert_eq!(no_cluster.reason.as_deref(), Some("ClusterRequired"));
}
