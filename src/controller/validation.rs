//! Validation of PostgresCluster specs and spec changes
//!
//! Shared by the reconciler, which surfaces failures through the
//! `ConfigurationValid` condition, and by the admission webhook.

use crate::controller::error::{Error, Result};
use crate::controller::fencing::FencedInstances;
use crate::controller::recovery::parse_target_time;
use crate::controller::resize::ExpansionStep;
use crate::crd::{
    BootstrapSpec, ImportType, PostgresCluster, PostgresClusterSpec, ResizeConfiguration, StorageSpec,
};
use crate::objectstore::parse_destination;
use crate::postgres::instance_client::validate_slot_name;
use crate::resources::common::ANNOTATION_FENCED_INSTANCES;
use crate::resources::quantity::parse_quantity;

pub const MIN_INSTANCES: i32 = 1;
pub const MAX_INSTANCES: i32 = 100;

/// Validate a cluster spec in isolation
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    let spec = &cluster.spec;
    validate_instances(spec.instances)?;
    validate_storage("storage", &spec.storage)?;
    if let Some(wal) = &spec.wal_storage {
        validate_storage("walStorage", wal)?;
    }
    if spec.replication_slots.high_availability.enabled {
        validate_slot_name(&format!("{}x", spec.replication_slots.high_availability.slot_prefix))?;
    }
    if let Some(backup) = &spec.backup {
        parse_destination(&backup.barman_object_store.destination_path)?;
    }
    if let Some(bootstrap) = &spec.bootstrap {
        validate_bootstrap(spec, bootstrap)?;
    }
    validate_fencing_annotation(cluster)?;
    Ok(())
}

fn validate_instances(instances: i32) -> Result<()> {
    if !(MIN_INSTANCES..=MAX_INSTANCES).contains(&instances) {
        return Err(Error::ValidationError(format!(
            "instances must be between {} and {}, got {}",
            MIN_INSTANCES, MAX_INSTANCES, instances
        )));
    }
    Ok(())
}

fn validate_storage(field: &str, storage: &StorageSpec) -> Result<()> {
    let size = parse_quantity(&storage.size)
        .map_err(|e| Error::ValidationError(format!("{}.size: {}", field, e)))?;
    if size == 0 {
        return Err(Error::ValidationError(format!("{}.size must be positive", field)));
    }
    if let Some(resize) = &storage.resize {
        validate_resize(field, size, resize)?;
    }
    Ok(())
}

fn validate_resize(field: &str, size: u64, resize: &ResizeConfiguration) -> Result<()> {
    let invalid = |msg: String| Error::ValidationError(format!("{}.resize: {}", field, msg));

    if !(1..=99).contains(&resize.triggers.usage_threshold) {
        return Err(invalid(format!(
            "usageThreshold must be between 1 and 99, got {}",
            resize.triggers.usage_threshold
        )));
    }
    if let Some(min_available) = &resize.triggers.min_available {
        parse_quantity(min_available).map_err(|e| invalid(e.to_string()))?;
    }

    ExpansionStep::parse(&resize.expansion.step).map_err(|e| invalid(e.to_string()))?;
    let min_step = parse_quantity(&resize.expansion.min_step).map_err(|e| invalid(e.to_string()))?;
    let max_step = parse_quantity(&resize.expansion.max_step).map_err(|e| invalid(e.to_string()))?;
    if min_step > max_step {
        return Err(invalid(format!(
            "minStep {} is larger than maxStep {}",
            resize.expansion.min_step, resize.expansion.max_step
        )));
    }
    if let Some(limit) = &resize.expansion.limit {
        let limit_bytes = parse_quantity(limit).map_err(|e| invalid(e.to_string()))?;
        if limit_bytes < size {
            return Err(invalid(format!("limit {} is below the requested size", limit)));
        }
    }

    if resize.strategy.max_actions_per_day < 0 {
        return Err(invalid("maxActionsPerDay must not be negative".to_string()));
    }
    let wal = &resize.strategy.wal_safety_policy;
    if wal.max_pending_wal_files < 0 {
        return Err(invalid("maxPendingWALFiles must not be negative".to_string()));
    }
    if let Some(retention) = &wal.max_slot_retention {
        parse_quantity(retention).map_err(|e| invalid(e.to_string()))?;
    }
    Ok(())
}

/// Bootstrap holds exactly one method and every reference resolves
pub fn validate_bootstrap(spec: &PostgresClusterSpec, bootstrap: &BootstrapSpec) -> Result<()> {
    match (&bootstrap.initdb, &bootstrap.recovery) {
        (Some(_), Some(_)) => {
            return Err(Error::ValidationError(
                "bootstrap must specify only one of initdb and recovery".to_string(),
            ));
        }
        (None, None) => {
            return Err(Error::ValidationError(
                "bootstrap must specify one of initdb and recovery".to_string(),
            ));
        }
        _ => {}
    }

    if let Some(import) = bootstrap.initdb.as_ref().and_then(|i| i.import.as_ref()) {
        match import.type_ {
            ImportType::Microservice => {
                if import.databases.len() != 1 {
                    return Err(Error::ValidationError(
                        "microservice import needs exactly one database".to_string(),
                    ));
                }
                if !import.roles.is_empty() {
                    return Err(Error::ValidationError(
                        "microservice import cannot import roles".to_string(),
                    ));
                }
                if import.databases.iter().any(|d| d.contains('*')) {
                    return Err(Error::ValidationError(
                        "microservice import does not accept wildcards".to_string(),
                    ));
                }
            }
            ImportType::Monolith => {
                if import.databases.is_empty() {
                    return Err(Error::ValidationError(
                        "monolith import needs at least one database".to_string(),
                    ));
                }
            }
        }
        if spec.external_cluster(&import.source.external_cluster).is_none() {
            return Err(Error::ValidationError(format!(
                "import source '{}' is not in externalClusters",
                import.source.external_cluster
            )));
        }
    }

    if let Some(recovery) = &bootstrap.recovery {
        match (&recovery.backup, &recovery.source) {
            (Some(_), Some(_)) => {
                return Err(Error::ValidationError(
                    "recovery must specify only one of backup and source".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::ValidationError(
                    "recovery needs a backup or a source".to_string(),
                ));
            }
            (None, Some(source)) => {
                let external = spec.external_cluster(source).ok_or_else(|| {
                    Error::ValidationError(format!("recovery source '{}' is not in externalClusters", source))
                })?;
                let store = external.barman_object_store.as_ref().ok_or_else(|| {
                    Error::ValidationError(format!(
                        "recovery source '{}' has no barmanObjectStore",
                        source
                    ))
                })?;
                parse_destination(&store.destination_path)?;
            }
            (Some(_), None) => {}
        }
        if let Some(target_time) = recovery
            .recovery_target
            .as_ref()
            .and_then(|t| t.target_time.as_deref())
        {
            parse_target_time(target_time)?;
        }
    }

    Ok(())
}

/// The fenced-instances annotation must be a JSON array of names
pub fn validate_fencing_annotation(cluster: &PostgresCluster) -> Result<()> {
    let annotation = cluster
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_FENCED_INSTANCES));
    FencedInstances::parse(annotation.map(String::as_str)).map(|_| ())
}

/// What an update changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDiff {
    pub instances_changed: bool,
    /// Positive when scaling up
    pub instance_delta: i32,
    pub image_changed: bool,
    pub storage_grown: bool,
    pub parameters_changed: bool,
    pub resources_changed: bool,
}

impl SpecDiff {
    pub fn requires_rolling_update(&self) -> bool {
        self.image_changed || self.parameters_changed || self.resources_changed
    }

    pub fn has_changes(&self) -> bool {
        self.instances_changed
            || self.image_changed
            || self.storage_grown
            || self.parameters_changed
            || self.resources_changed
    }
}

/// Validate an update against the previous spec
pub fn validate_spec_change(old: &PostgresCluster, new: &PostgresCluster) -> Result<SpecDiff> {
    let (old_spec, new_spec) = (&old.spec, &new.spec);

    if old_spec.storage.storage_class != new_spec.storage.storage_class {
        return Err(Error::ValidationError(
            "storage.storageClass cannot be changed after creation".to_string(),
        ));
    }
    if old_spec.wal_storage.is_some() != new_spec.wal_storage.is_some() {
        return Err(Error::ValidationError(
            "walStorage cannot be added or removed after creation".to_string(),
        ));
    }
    if old_spec.bootstrap != new_spec.bootstrap {
        return Err(Error::ValidationError(
            "bootstrap cannot be changed after creation".to_string(),
        ));
    }

    let storage_grown = check_no_shrink("storage", &old_spec.storage, &new_spec.storage)?;
    let wal_grown = match (&old_spec.wal_storage, &new_spec.wal_storage) {
        (Some(old_wal), Some(new_wal)) => check_no_shrink("walStorage", old_wal, new_wal)?,
        _ => false,
    };

    Ok(SpecDiff {
        instances_changed: old_spec.instances != new_spec.instances,
        instance_delta: new_spec.instances - old_spec.instances,
        image_changed: old_spec.image_name != new_spec.image_name,
        storage_grown: storage_grown || wal_grown,
        parameters_changed: old_spec.postgresql.parameters != new_spec.postgresql.parameters,
        resources_changed: old_spec.resources != new_spec.resources,
    })
}

/// Volumes can only grow; returns whether the size increased
fn check_no_shrink(field: &str, old: &StorageSpec, new: &StorageSpec) -> Result<bool> {
    let old_size = parse_quantity(&old.size)?;
    let new_size = parse_quantity(&new.size)?;
    if new_size < old_size {
        return Err(Error::ValidationError(format!(
            "{}.size cannot shrink from {} to {}",
            field, old.size, new.size
        )));
    }
    Ok(new_size > old_size)
}
