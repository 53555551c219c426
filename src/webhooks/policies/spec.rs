//! Spec validity
//!
//! The same checks the reconciler runs before acting, applied at admission
//! so invalid specs never reach the operator.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec;

pub fn validate_cluster_spec(ctx: &ValidationContext) -> ValidationResult {
    match validate_spec(ctx.cluster) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::denied("InvalidSpec", &e.to_string()),
    }
}
