//! Admission webhooks for PostgresCluster and ScheduledBackup validation
//!
//! Policies are organized into tiers:
//! - Tier 1 (Critical): Block invalid specs and forbidden spec changes
//! - Tier 2 (Production): Enforce production requirements based on namespace labels

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{WEBHOOK_PORT, WebhookError, run_webhook_server};
