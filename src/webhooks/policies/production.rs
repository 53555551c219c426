//! Production namespace policies
//!
//! These policies are only enforced when the namespace has the label `env=production`.
//!
//! Requirements for production namespaces:
//! - HA required (instances >= 3)
//! - Backup must be configured
//! - Resource limits required

use super::{ValidationContext, ValidationResult};

pub const PRODUCTION_MIN_INSTANCES: i32 = 3;

/// Validate production namespace requirements
///
/// Only called when namespace has `env=production` label.
pub fn validate_production(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.cluster.spec;

    if spec.instances < PRODUCTION_MIN_INSTANCES {
        return ValidationResult::denied(
            "ProductionHARequired",
            &format!(
                "Production clusters must have at least {} instances for high availability. Current: {}",
                PRODUCTION_MIN_INSTANCES, spec.instances
            ),
        );
    }

    if spec.backup.is_none() {
        return ValidationResult::denied(
            "ProductionBackupRequired",
            "Production clusters must have backup configured. Set spec.backup.barmanObjectStore.",
        );
    }

    let has_limits = spec
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .is_some_and(|l| l.cpu.is_some() && l.memory.is_some());
    if !has_limits {
        return ValidationResult::denied(
            "ProductionResourceLimitsRequired",
            "Production clusters must have CPU and memory limits configured. Set spec.resources.limits.cpu and spec.resources.limits.memory.",
        );
    }

    ValidationResult::allowed()
}
