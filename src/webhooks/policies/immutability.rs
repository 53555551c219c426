//! Immutability policies
//!
//! - Storage class, WAL volume presence and bootstrap cannot change
//! - Volumes can grow but never shrink

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec_change;

/// Validate immutable fields on UPDATE
pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    // Only apply immutability checks on UPDATE, not CREATE
    let Some(old_cluster) = ctx.old_cluster else {
        return ValidationResult::allowed();
    };

    match validate_spec_change(old_cluster, ctx.cluster) {
        Ok(_) => ValidationResult::allowed(),
        Err(e) => ValidationResult::denied("ImmutableFieldChanged", &e.to_string()),
    }
}
